//! Stream producer: one chat turn in, one multiplexed frame stream out.
//!
//! Admission and the upstream handshake happen before any frame is
//! emitted or any message row is created, so admission and handshake
//! failures never leave a partial assistant message behind. After
//! that, the relay loop forwards upstream units in order, executing
//! tool calls synchronously in place and wrapping each one in
//! `tool_call` / `tool_result` frames.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use brokerdesk_core::domain::conversation::{
    title_from_first_message, ChatMessage, Conversation, ConversationId, MessageId, UserId,
};
use brokerdesk_core::errors::{DomainError, TurnError};
use brokerdesk_core::ratelimit::{Admission, SlidingWindowLimiter};
use brokerdesk_core::wire;
use brokerdesk_db::repositories::{ConversationRepository, RepositoryError};

use crate::dispatch::{ToolDispatcher, TurnContext};
use crate::llm::{CompletionClient, CompletionRequest, PromptMessage, UpstreamEvent};

const FRAME_CHANNEL_CAPACITY: usize = 64;
const INTERRUPTED_NOTICE: &str = "\n\n[The response was interrupted before completion.]";

#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub caller: UserId,
    pub conversation_id: Option<ConversationId>,
    pub message: String,
}

/// A running turn: the conversation it belongs to and the outbound
/// frame stream. Dropping the receiver cancels the relay.
#[derive(Debug)]
pub struct TurnStream {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub frames: mpsc::Receiver<String>,
}

pub struct StreamProducer {
    llm: Arc<dyn CompletionClient>,
    dispatcher: Arc<ToolDispatcher>,
    conversations: Arc<dyn ConversationRepository>,
    limiter: Arc<SlidingWindowLimiter>,
    max_tool_invocations: u32,
}

impl StreamProducer {
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        dispatcher: Arc<ToolDispatcher>,
        conversations: Arc<dyn ConversationRepository>,
        limiter: Arc<SlidingWindowLimiter>,
        max_tool_invocations: u32,
    ) -> Self {
        Self { llm, dispatcher, conversations, limiter, max_tool_invocations }
    }

    pub async fn begin_turn(&self, request: TurnRequest) -> Result<TurnStream, TurnError> {
        let correlation_id = Uuid::new_v4().to_string();

        match self.limiter.admit(&request.caller.0).await {
            Admission::Allowed { remaining } => {
                tracing::debug!(
                    event_name = "assistant.admission.allowed",
                    correlation_id = %correlation_id,
                    caller = %request.caller,
                    remaining,
                    "turn admitted"
                );
            }
            Admission::AllowedDegraded => {
                tracing::warn!(
                    event_name = "assistant.admission.store_degraded",
                    correlation_id = %correlation_id,
                    caller = %request.caller,
                    "admission counter store unreachable; failing open"
                );
            }
            Admission::Denied { retry_after } => {
                tracing::warn!(
                    event_name = "assistant.admission.denied",
                    correlation_id = %correlation_id,
                    caller = %request.caller,
                    retry_after_secs = retry_after.as_secs(),
                    "turn denied by rate limiter"
                );
                return Err(TurnError::RateLimited {
                    retry_after_secs: retry_after.as_secs().max(1),
                });
            }
        }

        let now = Utc::now();
        let conversation = match &request.conversation_id {
            Some(id) => {
                let found = self
                    .conversations
                    .find_conversation(id)
                    .await
                    .map_err(persistence_error)?
                    .filter(|conversation| conversation.owner == request.caller);
                found.ok_or_else(|| {
                    DomainError::InvariantViolation(format!("conversation not found: {id}"))
                })?
            }
            None => {
                let conversation = Conversation::new(
                    request.caller.clone(),
                    title_from_first_message(&request.message),
                    now,
                );
                self.conversations
                    .create_conversation(&conversation)
                    .await
                    .map_err(persistence_error)?;
                conversation
            }
        };

        let prior = self
            .conversations
            .list_messages(&conversation.id)
            .await
            .map_err(persistence_error)?;
        let mut prompt: Vec<PromptMessage> = prior
            .iter()
            .filter(|message| !message.in_progress)
            .map(|message| PromptMessage { role: message.role, content: message.content.clone() })
            .collect();
        prompt.push(PromptMessage {
            role: brokerdesk_core::domain::conversation::MessageRole::User,
            content: request.message.clone(),
        });

        // Handshake before any message row exists: a handshake failure
        // is fatal for the turn and must not create a partial message.
        let upstream = self
            .llm
            .begin_stream(CompletionRequest {
                caller: request.caller.clone(),
                conversation_id: conversation.id.clone(),
                messages: prompt,
            })
            .await
            .map_err(|error| TurnError::UpstreamHandshake(error.to_string()))?;

        let user_message = ChatMessage::user(conversation.id.clone(), request.message.trim(), now);
        self.conversations.insert_message(&user_message).await.map_err(persistence_error)?;

        let assistant = ChatMessage::assistant_in_progress(conversation.id.clone(), now);
        self.conversations.insert_message(&assistant).await.map_err(|error| match error {
            RepositoryError::Conflict(_) => TurnError::Domain(DomainError::TurnAlreadyInProgress),
            other => persistence_error(other),
        })?;

        tracing::info!(
            event_name = "assistant.turn.started",
            correlation_id = %correlation_id,
            conversation_id = %conversation.id,
            caller = %request.caller,
            "assistant turn started"
        );

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let relay = RelayTask {
            dispatcher: self.dispatcher.clone(),
            conversations: self.conversations.clone(),
            context: TurnContext {
                caller: request.caller,
                conversation_id: conversation.id.clone(),
                message_id: Some(assistant.id.clone()),
                correlation_id,
            },
            message_id: assistant.id.clone(),
            max_tool_invocations: self.max_tool_invocations,
        };
        tokio::spawn(async move {
            relay.run(upstream, tx).await;
        });

        Ok(TurnStream {
            conversation_id: conversation.id,
            message_id: assistant.id,
            frames: rx,
        })
    }
}

fn persistence_error(error: RepositoryError) -> TurnError {
    TurnError::Persistence(error.to_string())
}

struct RelayTask {
    dispatcher: Arc<ToolDispatcher>,
    conversations: Arc<dyn ConversationRepository>,
    context: TurnContext,
    message_id: MessageId,
    max_tool_invocations: u32,
}

impl RelayTask {
    async fn run(self, mut upstream: mpsc::Receiver<UpstreamEvent>, tx: mpsc::Sender<String>) {
        let mut executed_tools = 0u32;

        loop {
            let Some(event) = upstream.recv().await else {
                // Upstream hung up without a terminal signal.
                self.fail_turn(&tx, "connection closed before stream completed").await;
                return;
            };

            match event {
                UpstreamEvent::TextDelta(delta) => {
                    self.append_content(&delta).await;
                    let frame = wire::encode_frame(&wire::content_payload(delta));
                    if tx.send(frame).await.is_err() {
                        self.finalize(None).await;
                        return;
                    }
                }
                UpstreamEvent::ToolCallRequest(invocation) => {
                    let started_frame = wire::encode_frame(&wire::tool_call_payload(
                        invocation.name.clone(),
                        invocation.arguments.clone(),
                    ));
                    if tx.send(started_frame).await.is_err() {
                        self.finalize(None).await;
                        return;
                    }

                    let execution = if executed_tools >= self.max_tool_invocations {
                        self.dispatcher
                            .reject(
                                &invocation,
                                &self.context,
                                "tool invocation limit reached for this turn",
                            )
                            .await
                    } else {
                        executed_tools += 1;
                        self.dispatcher.execute(&invocation, &self.context).await
                    };

                    let result_frame = wire::encode_frame(&wire::tool_result_payload(
                        execution.name,
                        execution.outcome,
                    ));
                    if tx.send(result_frame).await.is_err() {
                        self.finalize(None).await;
                        return;
                    }
                }
                UpstreamEvent::Done => {
                    self.finalize(None).await;
                    let _ = tx.send(wire::done_frame()).await;
                    tracing::info!(
                        event_name = "assistant.turn.completed",
                        correlation_id = %self.context.correlation_id,
                        conversation_id = %self.context.conversation_id,
                        executed_tools,
                        "assistant turn completed"
                    );
                    return;
                }
                UpstreamEvent::Error(message) => {
                    self.fail_turn(&tx, &message).await;
                    return;
                }
            }
        }
    }

    async fn append_content(&self, delta: &str) {
        if let Err(error) = self.conversations.append_message_content(&self.message_id, delta).await
        {
            tracing::warn!(
                event_name = "assistant.turn.persist_failed",
                correlation_id = %self.context.correlation_id,
                error = %error,
                "failed to append streamed content; stream continues"
            );
        }
    }

    async fn finalize(&self, final_content: Option<&str>) {
        if let Err(error) =
            self.conversations.finalize_message(&self.message_id, final_content).await
        {
            tracing::warn!(
                event_name = "assistant.turn.persist_failed",
                correlation_id = %self.context.correlation_id,
                error = %error,
                "failed to finalize assistant message"
            );
        }
    }

    /// Upstream failed mid-stream: applied tool calls stay applied, the
    /// message is closed with an interruption note appended to whatever
    /// content accumulated, and the error is relayed downstream.
    async fn fail_turn(&self, tx: &mpsc::Sender<String>, message: &str) {
        tracing::warn!(
            event_name = "assistant.turn.upstream_error",
            correlation_id = %self.context.correlation_id,
            conversation_id = %self.context.conversation_id,
            error = %message,
            "upstream stream terminated with an error"
        );
        self.append_content(INTERRUPTED_NOTICE).await;
        self.finalize(None).await;
        let _ = tx.send(wire::encode_frame(&wire::error_payload(message))).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use brokerdesk_core::audit::InMemoryAuditSink;
    use brokerdesk_core::domain::conversation::UserId;
    use brokerdesk_core::domain::tool::{ToolInvocation, ToolOutcome};
    use brokerdesk_core::errors::TurnError;
    use brokerdesk_core::ratelimit::{InMemoryAdmissionStore, SlidingWindowLimiter};
    use brokerdesk_core::wire::{FrameBuffer, FrameParse, WireEvent};
    use brokerdesk_db::repositories::{InMemoryConversationRepository, InMemoryCrmStore};

    use super::{StreamProducer, TurnRequest};
    use crate::audit::AuditRecorder;
    use crate::dispatch::ToolDispatcher;
    use crate::llm::{ScriptedCompletionClient, UpstreamEvent};

    struct Harness {
        producer: StreamProducer,
        conversations: InMemoryConversationRepository,
        store: InMemoryCrmStore,
        sink: InMemoryAuditSink,
    }

    fn harness(client: ScriptedCompletionClient, max_admissions: u32, max_tools: u32) -> Harness {
        let user = UserId("user-1".to_owned());
        let store = InMemoryCrmStore::with_pipeline(&user);
        let sink = InMemoryAuditSink::default();
        let conversations = InMemoryConversationRepository::default();
        let limiter = Arc::new(SlidingWindowLimiter::new(
            Arc::new(InMemoryAdmissionStore::default()),
            max_admissions,
            Duration::from_secs(15),
        ));
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::new(store.clone()),
            AuditRecorder::new(Arc::new(sink.clone())),
        ));
        let producer = StreamProducer::new(
            Arc::new(client),
            dispatcher,
            Arc::new(conversations.clone()),
            limiter,
            max_tools,
        );
        Harness { producer, conversations, store, sink }
    }

    fn request(message: &str) -> TurnRequest {
        TurnRequest {
            caller: UserId("user-1".to_owned()),
            conversation_id: None,
            message: message.to_owned(),
        }
    }

    async fn drain(mut frames: tokio::sync::mpsc::Receiver<String>) -> (Vec<WireEvent>, bool) {
        let mut buffer = FrameBuffer::new();
        while let Some(frame) = frames.recv().await {
            buffer.push_bytes(frame.as_bytes());
        }
        let mut events = Vec::new();
        let mut done = false;
        while let Some(parse) = buffer.next_frame() {
            match parse {
                FrameParse::Event(payload) => events.extend(payload.into_events()),
                FrameParse::Done => done = true,
                FrameParse::Incomplete => break,
                FrameParse::Malformed(detail) => panic!("malformed frame: {detail}"),
            }
        }
        (events, done)
    }

    #[tokio::test]
    async fn relays_content_and_tool_lifecycle_in_upstream_order() {
        let script = vec![
            UpstreamEvent::TextDelta("Hello".to_owned()),
            UpstreamEvent::ToolCallRequest(ToolInvocation::new(
                "create_deal",
                json!({ "stage_id": "stage-new", "title": "Acme renewal" }),
            )),
            UpstreamEvent::TextDelta(" done".to_owned()),
            UpstreamEvent::Done,
        ];
        let harness = harness(ScriptedCompletionClient::with_scripts(vec![script]), 10, 5);

        let turn =
            harness.producer.begin_turn(request("create a deal for acme")).await.expect("turn");
        let (events, done) = drain(turn.frames).await;

        assert!(done);
        assert_eq!(
            events,
            vec![
                WireEvent::ContentDelta("Hello".to_owned()),
                WireEvent::ToolCallStarted {
                    name: "create_deal".to_owned(),
                    arguments: json!({ "stage_id": "stage-new", "title": "Acme renewal" }),
                },
                WireEvent::ToolResult {
                    name: "create_deal".to_owned(),
                    outcome: ToolOutcome::Succeeded,
                },
                WireEvent::ContentDelta(" done".to_owned()),
            ]
        );

        // Exactly one audit record, the deal applied, the message final.
        assert_eq!(harness.sink.records().len(), 1);
        assert_eq!(harness.store.deals_snapshot().len(), 2);

        let messages = harness.conversations.messages_snapshot();
        let assistant = messages.iter().find(|m| m.id == turn.message_id).expect("assistant row");
        assert_eq!(assistant.content, "Hello done");
        assert!(!assistant.in_progress);
    }

    #[tokio::test]
    async fn denied_admission_fails_before_any_stream_exists() {
        let harness = harness(ScriptedCompletionClient::default(), 1, 5);

        let first = harness.producer.begin_turn(request("first")).await.expect("first turn");
        drain(first.frames).await;

        let second = harness.producer.begin_turn(request("second")).await;
        let Err(TurnError::RateLimited { retry_after_secs }) = second else {
            panic!("expected rate limit, got {second:?}");
        };
        assert!(retry_after_secs >= 1);

        // Only the first turn left message rows behind.
        let messages = harness.conversations.messages_snapshot();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn handshake_failure_creates_no_partial_message() {
        let harness =
            harness(ScriptedCompletionClient::with_handshake_failure("gateway returned 503"), 10, 5);

        let result = harness.producer.begin_turn(request("hello")).await;
        assert!(matches!(result, Err(TurnError::UpstreamHandshake(_))));
        assert!(harness.conversations.messages_snapshot().is_empty());
    }

    #[tokio::test]
    async fn tool_failure_is_isolated_and_the_stream_continues() {
        let script = vec![
            UpstreamEvent::ToolCallRequest(ToolInvocation::new(
                "create_deal",
                json!({ "stage_id": "stage-missing", "title": "Doomed" }),
            )),
            UpstreamEvent::TextDelta("I could not create that deal.".to_owned()),
            UpstreamEvent::Done,
        ];
        let harness = harness(ScriptedCompletionClient::with_scripts(vec![script]), 10, 5);

        let turn = harness.producer.begin_turn(request("try it")).await.expect("turn");
        let (events, done) = drain(turn.frames).await;

        assert!(done, "a failed tool must not abort the stream");
        assert!(events.contains(&WireEvent::ToolResult {
            name: "create_deal".to_owned(),
            outcome: ToolOutcome::Failed,
        }));
        let records = harness.sink.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].error_detail.is_some());
    }

    #[tokio::test]
    async fn mid_stream_error_finalizes_with_interruption_note() {
        let script = vec![
            UpstreamEvent::TextDelta("Partial answer".to_owned()),
            UpstreamEvent::Error("gateway reset".to_owned()),
        ];
        let harness = harness(ScriptedCompletionClient::with_scripts(vec![script]), 10, 5);

        let turn = harness.producer.begin_turn(request("hello")).await.expect("turn");
        let (events, done) = drain(turn.frames).await;

        assert!(!done);
        assert!(events.contains(&WireEvent::StreamError { message: "gateway reset".to_owned() }));

        let messages = harness.conversations.messages_snapshot();
        let assistant = messages.iter().find(|m| m.id == turn.message_id).expect("assistant row");
        assert!(assistant.content.starts_with("Partial answer"));
        assert!(assistant.content.contains("interrupted"));
        assert!(!assistant.in_progress);
    }

    #[tokio::test]
    async fn tool_budget_rejects_excess_invocations_but_keeps_streaming() {
        let tool = |title: &str| {
            UpstreamEvent::ToolCallRequest(ToolInvocation::new(
                "create_deal",
                json!({ "stage_id": "stage-new", "title": title }),
            ))
        };
        let script = vec![tool("First deal"), tool("Second deal"), UpstreamEvent::Done];
        let harness = harness(ScriptedCompletionClient::with_scripts(vec![script]), 10, 1);

        let turn = harness.producer.begin_turn(request("two deals")).await.expect("turn");
        let (events, done) = drain(turn.frames).await;

        assert!(done);
        let outcomes: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                WireEvent::ToolResult { outcome, .. } => Some(*outcome),
                _ => None,
            })
            .collect();
        assert_eq!(outcomes, vec![ToolOutcome::Succeeded, ToolOutcome::Failed]);

        // Seeded deal + exactly one created.
        assert_eq!(harness.store.deals_snapshot().len(), 2);
        assert_eq!(harness.sink.records().len(), 2);
    }

    #[tokio::test]
    async fn follow_up_turn_reuses_the_conversation() {
        let scripts = vec![
            vec![UpstreamEvent::TextDelta("First reply".to_owned()), UpstreamEvent::Done],
            vec![UpstreamEvent::TextDelta("Second reply".to_owned()), UpstreamEvent::Done],
        ];
        let harness = harness(ScriptedCompletionClient::with_scripts(scripts), 10, 5);

        let first = harness.producer.begin_turn(request("first")).await.expect("first turn");
        let conversation_id = first.conversation_id.clone();
        drain(first.frames).await;

        let second = harness
            .producer
            .begin_turn(TurnRequest {
                caller: UserId("user-1".to_owned()),
                conversation_id: Some(conversation_id.clone()),
                message: "second".to_owned(),
            })
            .await
            .expect("second turn");
        assert_eq!(second.conversation_id, conversation_id);
        drain(second.frames).await;

        let messages = harness.conversations.messages_snapshot();
        assert_eq!(messages.len(), 4);
    }
}
