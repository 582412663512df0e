//! Assistant orchestration: the server side of the streaming pipeline.
//!
//! One chat turn flows through three collaborators:
//! 1. **Admission** (`brokerdesk_core::ratelimit`) gates the turn.
//! 2. **Stream production** (`producer`) opens the upstream completion
//!    stream and relays token deltas downstream.
//! 3. **Tool dispatch** (`dispatch`) executes tool calls detected
//!    mid-stream against the CRM store, each wrapped in an audit
//!    envelope (`audit`).
//!
//! The upstream language model is strictly an external collaborator
//! behind `llm::CompletionClient`; nothing here depends on its
//! reasoning or prompt content.

pub mod audit;
pub mod dispatch;
pub mod llm;
pub mod producer;

pub use audit::AuditRecorder;
pub use dispatch::{ToolDispatcher, ToolExecution, TurnContext};
pub use llm::{
    CompletionClient, CompletionError, CompletionRequest, HttpCompletionClient, PromptMessage,
    ScriptedCompletionClient, UpstreamEvent,
};
pub use producer::{StreamProducer, TurnRequest, TurnStream};
