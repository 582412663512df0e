//! Client side of the streaming assistant pipeline.
//!
//! Consumes the multiplexed event stream produced by the server:
//! reconstructs the live assistant message, surfaces tool lifecycle
//! notifications on a typed event channel, manages the dual
//! timeout/fallback timers and user cancellation, and cascades cache
//! invalidation for completed write tools so the rest of the UI
//! observes side effects without a reload.

pub mod cascade;
pub mod consumer;
pub mod events;
pub mod transport;

pub use cascade::{InvalidationCascade, QueryCache, RecordingQueryCache};
pub use consumer::{ConsumerOptions, StreamConsumer, SYNTHETIC_ANALYZING_TOOL, TIMEOUT_NOTICE};
pub use events::{AssistantEvent, FinalizedMessage, Termination};
pub use transport::{ChatTurnRequest, HttpChatTransport, TransportError};
