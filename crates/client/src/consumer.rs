//! Stream consumer: incremental parsing plus the turn state machine.
//!
//! A single task owns the whole turn: it suspends only while waiting
//! for the next transport chunk, and all parsing between chunks is
//! synchronous. Two independent timers run alongside the transport —
//! the hard timeout aborts the turn outright, the soft fallback emits
//! one synthetic "analyzing" notification for perceived
//! responsiveness — and an explicit user cancel can end the turn at
//! any point. Whichever terminal trigger fires first wins; the others
//! become no-ops because the loop returns exactly once.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

use brokerdesk_core::config::AssistantConfig;
use brokerdesk_core::domain::tool::{ToolName, ToolOutcome};
use brokerdesk_core::wire::{FrameBuffer, FrameParse, WireEvent};

use crate::cascade::InvalidationCascade;
use crate::events::{AssistantEvent, FinalizedMessage, Termination};
use crate::transport::TransportError;

/// Shown instead of partial content when the hard timeout aborts the
/// turn. Unlike cancellation, the abort replaces what accumulated.
pub const TIMEOUT_NOTICE: &str = "The server took too long to respond. Please try again.";

/// Name of the synthetic soft-fallback tool notification.
pub const SYNTHETIC_ANALYZING_TOOL: &str = "analyzing";

#[derive(Clone, Copy, Debug)]
pub struct ConsumerOptions {
    pub hard_timeout: Duration,
    pub soft_fallback: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self { hard_timeout: Duration::from_secs(30), soft_fallback: Duration::from_secs(2) }
    }
}

impl ConsumerOptions {
    pub fn from_config(config: &AssistantConfig) -> Self {
        Self {
            hard_timeout: Duration::from_secs(config.hard_timeout_secs),
            soft_fallback: Duration::from_millis(config.soft_fallback_ms),
        }
    }
}

pub struct StreamConsumer {
    options: ConsumerOptions,
    events: mpsc::Sender<AssistantEvent>,
    cascade: InvalidationCascade,
}

impl StreamConsumer {
    pub fn new(
        options: ConsumerOptions,
        events: mpsc::Sender<AssistantEvent>,
        cascade: InvalidationCascade,
    ) -> Self {
        Self { options, events, cascade }
    }

    /// Consumes one turn's byte stream until a terminal trigger fires.
    ///
    /// Returning drops the transport, which releases the connection on
    /// every path (completion, timeout, cancel, error).
    pub async fn run<S>(
        mut self,
        mut transport: S,
        mut cancel: oneshot::Receiver<()>,
    ) -> FinalizedMessage
    where
        S: Stream<Item = Result<Vec<u8>, TransportError>> + Unpin,
    {
        let mut buffer = FrameBuffer::new();
        let mut content = String::new();
        let mut signal_seen = false;
        let mut soft_fired = false;
        let mut cancel_closed = false;

        let hard_deadline = tokio::time::sleep(self.options.hard_timeout);
        tokio::pin!(hard_deadline);
        let soft_deadline = tokio::time::sleep(self.options.soft_fallback);
        tokio::pin!(soft_deadline);

        loop {
            tokio::select! {
                result = &mut cancel, if !cancel_closed => {
                    match result {
                        Ok(()) => {
                            // User cancel preserves partial content.
                            return self.finalize(content, Termination::Cancelled).await;
                        }
                        Err(_) => {
                            // The cancel handle was dropped; that is
                            // not a cancellation request.
                            cancel_closed = true;
                        }
                    }
                }
                () = &mut hard_deadline => {
                    return self
                        .finalize(TIMEOUT_NOTICE.to_owned(), Termination::HardTimeout)
                        .await;
                }
                () = &mut soft_deadline, if !soft_fired && !signal_seen => {
                    soft_fired = true;
                    self.emit(AssistantEvent::ToolStarted {
                        name: SYNTHETIC_ANALYZING_TOOL.to_owned(),
                        synthetic: true,
                    })
                    .await;
                }
                chunk = transport.next() => {
                    let bytes = match chunk {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(error)) => {
                            return self
                                .finalize(content, Termination::UpstreamError(error.to_string()))
                                .await;
                        }
                        None => {
                            return self
                                .finalize(
                                    content,
                                    Termination::UpstreamError(
                                        "connection closed before stream completed".to_owned(),
                                    ),
                                )
                                .await;
                        }
                    };

                    buffer.push_bytes(&bytes);
                    while let Some(parse) = buffer.next_frame() {
                        match parse {
                            FrameParse::Incomplete => break,
                            FrameParse::Malformed(detail) => {
                                tracing::warn!(
                                    event_name = "assistant.consumer.malformed_frame",
                                    detail = %detail,
                                    "discarding malformed frame"
                                );
                            }
                            FrameParse::Done => {
                                return self.finalize(content, Termination::Completed).await;
                            }
                            FrameParse::Event(payload) => {
                                for event in payload.into_events() {
                                    signal_seen = true;
                                    if let Some(termination) =
                                        self.apply(event, &mut content).await
                                    {
                                        return self.finalize(content, termination).await;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Applies one wire event; returns a termination if the event is
    /// terminal for the turn.
    async fn apply(&mut self, event: WireEvent, content: &mut String) -> Option<Termination> {
        match event {
            WireEvent::ContentDelta(delta) => {
                content.push_str(&delta);
                self.emit(AssistantEvent::ContentUpdated { content: content.clone() }).await;
                None
            }
            WireEvent::ToolCallStarted { name, .. } => {
                self.emit(AssistantEvent::ToolStarted { name, synthetic: false }).await;
                None
            }
            WireEvent::ToolResult { name, outcome } => {
                if outcome == ToolOutcome::Succeeded {
                    if let Some(tool) = ToolName::parse(&name) {
                        // Fire-and-forget; never blocks the stream.
                        drop(self.cascade.on_write_tool_completed(tool));
                    }
                }
                self.emit(AssistantEvent::ToolCompleted { name, outcome }).await;
                None
            }
            WireEvent::StreamError { message } => Some(Termination::UpstreamError(message)),
        }
    }

    async fn emit(&self, event: AssistantEvent) {
        // A dropped receiver means the UI went away; the turn still
        // runs to its terminal state.
        let _ = self.events.send(event).await;
    }

    async fn finalize(&self, content: String, termination: Termination) -> FinalizedMessage {
        tracing::debug!(
            event_name = "assistant.consumer.finalized",
            termination = ?termination,
            "turn finalized"
        );
        let message = FinalizedMessage { content, termination };
        self.emit(AssistantEvent::Finalized(message.clone())).await;
        message
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};
    use tokio_stream::wrappers::ReceiverStream;

    use brokerdesk_core::cache::CachePartition;
    use brokerdesk_core::domain::tool::ToolOutcome;
    use brokerdesk_core::wire;

    use super::{ConsumerOptions, StreamConsumer, SYNTHETIC_ANALYZING_TOOL, TIMEOUT_NOTICE};
    use crate::cascade::{InvalidationCascade, RecordingQueryCache};
    use crate::events::{AssistantEvent, Termination};
    use crate::transport::TransportError;

    type Chunk = (Duration, Vec<u8>);

    fn scripted_transport(
        chunks: Vec<Chunk>,
        close_after: bool,
    ) -> ReceiverStream<Result<Vec<u8>, TransportError>> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for (delay, bytes) in chunks {
                tokio::time::sleep(delay).await;
                if tx.send(Ok(bytes)).await.is_err() {
                    return;
                }
            }
            if !close_after {
                // Keep the channel open past any test horizon.
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
        });
        ReceiverStream::new(rx)
    }

    struct TestTurn {
        consumer: StreamConsumer,
        events: mpsc::Receiver<AssistantEvent>,
        cache: RecordingQueryCache,
    }

    fn turn(options: ConsumerOptions) -> TestTurn {
        let (tx, rx) = mpsc::channel(64);
        let cache = RecordingQueryCache::default();
        let cascade = InvalidationCascade::new(Arc::new(cache.clone()));
        TestTurn { consumer: StreamConsumer::new(options, tx, cascade), events: rx, cache }
    }

    fn drain_events(events: &mut mpsc::Receiver<AssistantEvent>) -> Vec<AssistantEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    async fn settle_spawned_tasks() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn full_stream_bytes() -> Vec<u8> {
        let mut stream = String::new();
        stream.push_str(&wire::encode_frame(&wire::content_payload("Hello")));
        stream.push_str(&wire::encode_frame(&wire::tool_call_payload(
            "create_deal",
            json!({ "title": "Acme renewal", "stage_id": "stage-1" }),
        )));
        stream.push_str(&wire::encode_frame(&wire::tool_result_payload(
            "create_deal",
            ToolOutcome::Succeeded,
        )));
        stream.push_str(&wire::encode_frame(&wire::content_payload(" done")));
        stream.push_str(&wire::done_frame());
        stream.into_bytes()
    }

    #[tokio::test(start_paused = true)]
    async fn reconstructs_content_across_awkward_chunk_splits() {
        let bytes = full_stream_bytes();
        // Deliberately split mid-payload.
        let chunks: Vec<Chunk> =
            bytes.chunks(7).map(|chunk| (Duration::ZERO, chunk.to_vec())).collect();
        let mut test = turn(ConsumerOptions::default());
        let transport = scripted_transport(chunks, true);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let finalized = test.consumer.run(transport, cancel_rx).await;
        settle_spawned_tasks().await;

        assert_eq!(finalized.termination, Termination::Completed);
        assert_eq!(finalized.content, "Hello done");

        let events = drain_events(&mut test.events);
        assert!(events.contains(&AssistantEvent::ToolStarted {
            name: "create_deal".to_owned(),
            synthetic: false,
        }));
        assert!(events.contains(&AssistantEvent::ToolCompleted {
            name: "create_deal".to_owned(),
            outcome: ToolOutcome::Succeeded,
        }));
        // Content updates are monotonic.
        let contents: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                AssistantEvent::ContentUpdated { content } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(contents, vec!["Hello".to_owned(), "Hello done".to_owned()]);

        // The write tool fired the cascade exactly once.
        assert!(test.cache.invalidated().contains(&CachePartition::CrmDeals));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_fallback_fires_once_when_nothing_arrives() {
        let first_content =
            wire::encode_frame(&wire::content_payload("late")).into_bytes();
        let done = wire::done_frame().into_bytes();
        let mut test = turn(ConsumerOptions::default());
        let transport = scripted_transport(
            vec![(Duration::from_secs(10), first_content), (Duration::ZERO, done)],
            true,
        );
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let finalized = test.consumer.run(transport, cancel_rx).await;
        assert_eq!(finalized.termination, Termination::Completed);

        let events = drain_events(&mut test.events);
        let synthetic: Vec<_> = events
            .iter()
            .filter(|event| {
                matches!(event, AssistantEvent::ToolStarted { synthetic: true, name }
                    if name.as_str() == SYNTHETIC_ANALYZING_TOOL)
            })
            .collect();
        assert_eq!(synthetic.len(), 1, "ten silent seconds produce exactly one fallback");

        // The fallback precedes the first real signal.
        let fallback_index = events
            .iter()
            .position(|event| matches!(event, AssistantEvent::ToolStarted { synthetic: true, .. }))
            .expect("fallback present");
        let content_index = events
            .iter()
            .position(|event| matches!(event, AssistantEvent::ContentUpdated { .. }))
            .expect("content present");
        assert!(fallback_index < content_index);
    }

    #[tokio::test(start_paused = true)]
    async fn soft_fallback_never_fires_after_an_early_signal() {
        let early_content = wire::encode_frame(&wire::content_payload("quick")).into_bytes();
        let done = wire::done_frame().into_bytes();
        let mut test = turn(ConsumerOptions::default());
        let transport = scripted_transport(
            vec![
                (Duration::from_millis(500), early_content),
                (Duration::from_secs(10), done),
            ],
            true,
        );
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let finalized = test.consumer.run(transport, cancel_rx).await;
        assert_eq!(finalized.termination, Termination::Completed);

        let events = drain_events(&mut test.events);
        assert!(
            !events
                .iter()
                .any(|event| matches!(event, AssistantEvent::ToolStarted { synthetic: true, .. })),
            "a real signal inside the fallback window must cancel the synthetic notification"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_replaces_partial_content_with_the_notice() {
        let partial = wire::encode_frame(&wire::content_payload("partial answer")).into_bytes();
        let mut test = turn(ConsumerOptions::default());
        let transport = scripted_transport(vec![(Duration::from_secs(1), partial)], false);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let finalized = test.consumer.run(transport, cancel_rx).await;

        assert_eq!(finalized.termination, Termination::HardTimeout);
        assert_eq!(finalized.content, TIMEOUT_NOTICE);

        let events = drain_events(&mut test.events);
        let finals = events
            .iter()
            .filter(|event| matches!(event, AssistantEvent::Finalized(_)))
            .count();
        assert_eq!(finals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_preserves_partial_content() {
        let partial = wire::encode_frame(&wire::content_payload("partial answer")).into_bytes();
        let mut test = turn(ConsumerOptions::default());
        let transport = scripted_transport(vec![(Duration::from_secs(1), partial)], false);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let _ = cancel_tx.send(());
        });

        let finalized = test.consumer.run(transport, cancel_rx).await;

        assert_eq!(finalized.termination, Termination::Cancelled);
        assert_eq!(finalized.content, "partial answer");
        let _ = drain_events(&mut test.events);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_cancel_handle_is_not_a_cancellation() {
        let done = wire::done_frame().into_bytes();
        let mut test = turn(ConsumerOptions::default());
        let transport = scripted_transport(vec![(Duration::from_secs(1), done)], true);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        drop(cancel_tx);

        let finalized = test.consumer.run(transport, cancel_rx).await;
        assert_eq!(finalized.termination, Termination::Completed);
        let _ = drain_events(&mut test.events);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_tool_results_trigger_the_cascade_once() {
        let mut stream = String::new();
        stream.push_str(&wire::encode_frame(&wire::tool_result_payload(
            "move_deal_to_stage",
            ToolOutcome::Succeeded,
        )));
        stream.push_str(&wire::encode_frame(&wire::tool_result_payload(
            "move_deal_to_stage",
            ToolOutcome::Succeeded,
        )));
        stream.push_str(&wire::done_frame());

        let mut test = turn(ConsumerOptions::default());
        let transport =
            scripted_transport(vec![(Duration::ZERO, stream.into_bytes())], true);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        test.consumer.run(transport, cancel_rx).await;
        settle_spawned_tasks().await;

        let deal_invalidations = test
            .cache
            .invalidated()
            .iter()
            .filter(|partition| **partition == CachePartition::CrmDeals)
            .count();
        assert_eq!(deal_invalidations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tool_results_do_not_invalidate_caches() {
        let mut stream = String::new();
        stream.push_str(&wire::encode_frame(&wire::tool_result_payload(
            "create_deal",
            ToolOutcome::Failed,
        )));
        stream.push_str(&wire::done_frame());

        let mut test = turn(ConsumerOptions::default());
        let transport =
            scripted_transport(vec![(Duration::ZERO, stream.into_bytes())], true);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        test.consumer.run(transport, cancel_rx).await;
        settle_spawned_tasks().await;

        assert!(test.cache.invalidated().is_empty());
        let _ = drain_events(&mut test.events);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_error_frame_preserves_content() {
        let mut stream = String::new();
        stream.push_str(&wire::encode_frame(&wire::content_payload("some text")));
        stream.push_str(&wire::encode_frame(&wire::error_payload("gateway reset")));

        let mut test = turn(ConsumerOptions::default());
        let transport =
            scripted_transport(vec![(Duration::ZERO, stream.into_bytes())], true);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let finalized = test.consumer.run(transport, cancel_rx).await;
        assert_eq!(
            finalized.termination,
            Termination::UpstreamError("gateway reset".to_owned())
        );
        assert_eq!(finalized.content, "some text");
        let _ = drain_events(&mut test.events);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_closing_without_sentinel_is_an_upstream_error() {
        let content = wire::encode_frame(&wire::content_payload("cut off")).into_bytes();
        let mut test = turn(ConsumerOptions::default());
        let transport = scripted_transport(vec![(Duration::ZERO, content)], true);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let finalized = test.consumer.run(transport, cancel_rx).await;
        assert!(matches!(finalized.termination, Termination::UpstreamError(_)));
        assert_eq!(finalized.content, "cut off");
        let _ = drain_events(&mut test.events);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_skipped_without_ending_the_turn() {
        let mut stream = String::new();
        stream.push_str("data: {\"choices\": 42}\n\n");
        stream.push_str(&wire::encode_frame(&wire::content_payload("still here")));
        stream.push_str(&wire::done_frame());

        let mut test = turn(ConsumerOptions::default());
        let transport =
            scripted_transport(vec![(Duration::ZERO, stream.into_bytes())], true);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let finalized = test.consumer.run(transport, cancel_rx).await;
        assert_eq!(finalized.termination, Termination::Completed);
        assert_eq!(finalized.content, "still here");
        let _ = drain_events(&mut test.events);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_completion_and_hard_timeout_finalize_exactly_once() {
        let options = ConsumerOptions {
            hard_timeout: Duration::from_secs(5),
            soft_fallback: Duration::from_secs(2),
        };
        let done = wire::done_frame().into_bytes();
        let mut test = turn(options);
        // The sentinel lands exactly at the hard deadline.
        let transport = scripted_transport(vec![(Duration::from_secs(5), done)], false);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let finalized = test.consumer.run(transport, cancel_rx).await;

        assert!(
            matches!(finalized.termination, Termination::Completed | Termination::HardTimeout),
            "either trigger may win the race"
        );
        let events = drain_events(&mut test.events);
        let finals = events
            .iter()
            .filter(|event| matches!(event, AssistantEvent::Finalized(_)))
            .count();
        assert_eq!(finals, 1, "finalization happens exactly once");
    }
}
