//! Upstream completion-provider interface.
//!
//! The provider is an external collaborator: this module defines the
//! seam (`CompletionClient`), an HTTP implementation speaking the
//! OpenAI-compatible SSE dialect, and a scripted fake for tests and
//! smoke runs. Mid-stream failures surface as `UpstreamEvent::Error`
//! on the channel; only handshake failures are returned as `Err` so a
//! turn can fail before any frame is emitted.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use brokerdesk_core::config::LlmConfig;
use brokerdesk_core::domain::conversation::{ConversationId, MessageRole, UserId};
use brokerdesk_core::domain::tool::ToolInvocation;
use brokerdesk_core::wire::{FrameBuffer, FrameParse, WireEvent};

const UPSTREAM_CHANNEL_CAPACITY: usize = 64;
const MAX_STREAM_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const MAX_MALFORMED_PAYLOADS: usize = 3;
const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamEvent {
    TextDelta(String),
    ToolCallRequest(ToolInvocation),
    Done,
    Error(String),
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("upstream handshake failed: {0}")]
    Handshake(String),
}

#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub caller: UserId,
    pub conversation_id: ConversationId,
    pub messages: Vec<PromptMessage>,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn begin_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, CompletionError>;
}

/// HTTP client for an OpenAI-compatible chat-completions gateway.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    gateway_url: String,
    api_key: Option<SecretString>,
    model: String,
    idle_timeout: Duration,
}

impl HttpCompletionClient {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            gateway_url: config.gateway_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            idle_timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
    user: &'a str,
}

async fn read_capped_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// The gateway reports tool arguments either as a structured object or
/// as a JSON-encoded string; normalize to a structured value.
fn normalize_arguments(arguments: serde_json::Value) -> serde_json::Value {
    match arguments {
        serde_json::Value::String(raw) => {
            serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
        }
        other => other,
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn begin_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, CompletionError> {
        let body = GatewayRequest {
            model: &self.model,
            messages: &request.messages,
            stream: true,
            user: &request.caller.0,
        };

        let mut http_request = self.client.post(&self.gateway_url).json(&body);
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key.expose_secret());
        }

        let response = http_request
            .send()
            .await
            .map_err(|error| CompletionError::Handshake(error.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = read_capped_error_body(response).await;
            return Err(CompletionError::Handshake(format!("gateway returned {status}: {detail}")));
        }

        let (tx, rx) = mpsc::channel(UPSTREAM_CHANNEL_CAPACITY);
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            pump_sse_stream(response, tx, idle_timeout).await;
        });

        Ok(rx)
    }
}

async fn pump_sse_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<UpstreamEvent>,
    idle_timeout: Duration,
) {
    let mut stream = response.bytes_stream();
    let mut buffer = FrameBuffer::new();
    let mut malformed = 0usize;

    loop {
        let next = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = tx.send(UpstreamEvent::Error("stream idle timeout".to_owned())).await;
                return;
            }
        };

        let Some(chunk) = next else {
            // Transport closed without the completion sentinel.
            let _ = tx
                .send(UpstreamEvent::Error(
                    "connection closed before stream completed".to_owned(),
                ))
                .await;
            return;
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                let _ = tx.send(UpstreamEvent::Error(error.to_string())).await;
                return;
            }
        };

        buffer.push_bytes(&chunk);
        if buffer.buffered_len() > MAX_STREAM_BUFFER_BYTES {
            let _ = tx
                .send(UpstreamEvent::Error("stream buffer exceeded maximum size".to_owned()))
                .await;
            return;
        }

        while let Some(parse) = buffer.next_frame() {
            match parse {
                FrameParse::Incomplete => break,
                FrameParse::Done => {
                    let _ = tx.send(UpstreamEvent::Done).await;
                    return;
                }
                FrameParse::Malformed(detail) => {
                    malformed += 1;
                    tracing::warn!(
                        event_name = "assistant.upstream.malformed_payload",
                        detail = %detail,
                        "discarding malformed upstream payload"
                    );
                    if malformed >= MAX_MALFORMED_PAYLOADS {
                        let _ = tx
                            .send(UpstreamEvent::Error(format!("invalid stream payload: {detail}")))
                            .await;
                        return;
                    }
                }
                FrameParse::Event(payload) => {
                    malformed = 0;
                    for event in payload.into_events() {
                        let upstream_event = match event {
                            WireEvent::ContentDelta(delta) => UpstreamEvent::TextDelta(delta),
                            WireEvent::ToolCallStarted { name, arguments } => {
                                UpstreamEvent::ToolCallRequest(ToolInvocation::new(
                                    name,
                                    normalize_arguments(arguments),
                                ))
                            }
                            WireEvent::ToolResult { .. } => continue,
                            WireEvent::StreamError { message } => UpstreamEvent::Error(message),
                        };
                        let terminal = matches!(upstream_event, UpstreamEvent::Error(_));
                        if tx.send(upstream_event).await.is_err() || terminal {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Deterministic completion client: each `begin_stream` call replays
/// the next queued script. Used by agent tests and the smoke command.
#[derive(Default)]
pub struct ScriptedCompletionClient {
    scripts: Mutex<VecDeque<Result<Vec<UpstreamEvent>, String>>>,
}

impl ScriptedCompletionClient {
    pub fn with_scripts(scripts: Vec<Vec<UpstreamEvent>>) -> Self {
        Self { scripts: Mutex::new(scripts.into_iter().map(Ok).collect()) }
    }

    pub fn with_handshake_failure(detail: impl Into<String>) -> Self {
        Self { scripts: Mutex::new(VecDeque::from([Err(detail.into())])) }
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn begin_stream(
        &self,
        _request: CompletionRequest,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, CompletionError> {
        let script = {
            let mut scripts = match self.scripts.lock() {
                Ok(scripts) => scripts,
                Err(poisoned) => poisoned.into_inner(),
            };
            scripts.pop_front().unwrap_or(Ok(vec![UpstreamEvent::Done]))
        };

        let events = script.map_err(CompletionError::Handshake)?;
        let (tx, rx) = mpsc::channel(UPSTREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::normalize_arguments;

    #[test]
    fn string_encoded_arguments_are_unwrapped() {
        let normalized =
            normalize_arguments(json!("{\"deal_id\":\"deal-1\",\"stage_id\":\"stage-won\"}"));
        assert_eq!(normalized, json!({ "deal_id": "deal-1", "stage_id": "stage-won" }));
    }

    #[test]
    fn structured_arguments_pass_through() {
        let normalized = normalize_arguments(json!({ "days": 30 }));
        assert_eq!(normalized, json!({ "days": 30 }));
    }

    #[test]
    fn non_json_string_arguments_are_kept_verbatim() {
        let normalized = normalize_arguments(json!("not json"));
        assert_eq!(normalized, json!("not json"));
    }
}
