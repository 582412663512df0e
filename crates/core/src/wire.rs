//! Outbound event-stream wire format.
//!
//! The stream is newline-delimited text. Content frames carry the
//! `data:` marker followed by a JSON payload; the reserved payload
//! `[DONE]` signals logical completion; lines starting with `:` are
//! keep-alive comments and carry no payload. The producer emits this
//! format and the consumer parses it incrementally, so both sides share
//! the payload types and the `FrameBuffer` below.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::tool::ToolOutcome;

pub const EVENT_MARKER: &str = "data:";
pub const COMMENT_MARKER: char = ':';
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded `data:` payload. A single payload may carry several
/// notifications (tool-call starts, a tool result, a content delta).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub delta: Delta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub function: FunctionDelta,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDelta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub name: String,
    pub outcome: ToolOutcome,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Semantic events extracted from one payload, in payload order.
#[derive(Clone, Debug, PartialEq)]
pub enum WireEvent {
    ContentDelta(String),
    ToolCallStarted { name: String, arguments: Value },
    ToolResult { name: String, outcome: ToolOutcome },
    StreamError { message: String },
}

impl StreamPayload {
    pub fn into_events(self) -> Vec<WireEvent> {
        let mut events = Vec::new();

        for choice in self.choices {
            if let Some(tool_calls) = choice.delta.tool_calls {
                for call in tool_calls {
                    events.push(WireEvent::ToolCallStarted {
                        name: call.function.name,
                        arguments: call.function.arguments.unwrap_or(Value::Null),
                    });
                }
            }
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    events.push(WireEvent::ContentDelta(content));
                }
            }
        }

        if let Some(result) = self.tool_result {
            events.push(WireEvent::ToolResult { name: result.name, outcome: result.outcome });
        }

        if let Some(error) = self.error {
            events.push(WireEvent::StreamError { message: error.message });
        }

        events
    }
}

pub fn content_payload(text: impl Into<String>) -> StreamPayload {
    StreamPayload {
        choices: vec![Choice {
            delta: Delta { content: Some(text.into()), tool_calls: None },
            finish_reason: None,
        }],
        ..StreamPayload::default()
    }
}

pub fn tool_call_payload(name: impl Into<String>, arguments: Value) -> StreamPayload {
    StreamPayload {
        choices: vec![Choice {
            delta: Delta {
                content: None,
                tool_calls: Some(vec![ToolCallDelta {
                    function: FunctionDelta { name: name.into(), arguments: Some(arguments) },
                }]),
            },
            finish_reason: None,
        }],
        ..StreamPayload::default()
    }
}

pub fn tool_result_payload(name: impl Into<String>, outcome: ToolOutcome) -> StreamPayload {
    StreamPayload {
        tool_result: Some(ToolResultPayload { name: name.into(), outcome }),
        ..StreamPayload::default()
    }
}

pub fn error_payload(message: impl Into<String>) -> StreamPayload {
    StreamPayload {
        error: Some(ErrorPayload { message: message.into() }),
        ..StreamPayload::default()
    }
}

/// Serializes a payload into one wire frame.
pub fn encode_frame(payload: &StreamPayload) -> String {
    // Payload types only contain serializable fields; a failure here
    // would be a programming error, so degrade to an error frame.
    match serde_json::to_string(payload) {
        Ok(json) => format!("{EVENT_MARKER} {json}\n\n"),
        Err(_) => format!("{EVENT_MARKER} {{\"error\":{{\"message\":\"encode failure\"}}}}\n\n"),
    }
}

pub fn done_frame() -> String {
    format!("{EVENT_MARKER} {DONE_SENTINEL}\n\n")
}

pub fn keep_alive_frame() -> String {
    format!("{COMMENT_MARKER} keep-alive\n\n")
}

/// Outcome of one `FrameBuffer::next_frame` step.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameParse {
    /// A fully decoded payload.
    Event(StreamPayload),
    /// The `[DONE]` sentinel: the stream is logically complete even if
    /// the transport has not closed yet.
    Done,
    /// The buffered line is an incomplete fragment split across chunks.
    /// It has been pushed back in front of the buffer; stop processing
    /// until more bytes arrive.
    Incomplete,
    /// A complete marker line whose payload cannot be decoded for a
    /// reason other than truncation. The line has been discarded; the
    /// caller decides whether to log it.
    Malformed(String),
}

/// Incremental frame parser over a chunked byte stream.
///
/// Bytes are buffered raw and only decoded once a full line is
/// available, so chunk boundaries may fall anywhere, including inside a
/// multi-byte character or mid-payload. An incomplete JSON payload is
/// pushed back joined to the following bytes, which lets payloads that
/// span line boundaries decode once their closing bytes arrive.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Scans for the next frame. `None` means no complete line is
    /// buffered and more transport bytes are needed.
    pub fn next_frame(&mut self) -> Option<FrameParse> {
        loop {
            let newline = self.buffer.iter().position(|byte| *byte == b'\n')?;
            let line = String::from_utf8_lossy(&self.buffer[..newline]).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line).to_owned();

            if line.is_empty() {
                self.buffer.drain(..=newline);
                continue;
            }

            if let Some(rest) = line.strip_prefix(EVENT_MARKER) {
                let payload = rest.trim();
                if payload == DONE_SENTINEL {
                    self.buffer.drain(..=newline);
                    return Some(FrameParse::Done);
                }

                match serde_json::from_str::<StreamPayload>(payload) {
                    Ok(decoded) => {
                        self.buffer.drain(..=newline);
                        return Some(FrameParse::Event(decoded));
                    }
                    Err(error) if error.is_eof() => {
                        // Push the line back joined to whatever follows:
                        // the payload was split across a line boundary
                        // and needs the next chunk to complete.
                        self.buffer.remove(newline);
                        return Some(FrameParse::Incomplete);
                    }
                    Err(error) => {
                        self.buffer.drain(..=newline);
                        return Some(FrameParse::Malformed(error.to_string()));
                    }
                }
            }

            // Comment/keep-alive frames and anything without the event
            // marker are discarded.
            self.buffer.drain(..=newline);
        }
    }
}
