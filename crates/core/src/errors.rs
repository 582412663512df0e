use thiserror::Error;

/// Domain-level invariant failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("message {message_id} is finalized and can no longer change")]
    MessageFinalized { message_id: String },
    #[error("conversation already has a message in progress")]
    TurnAlreadyInProgress,
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Application-level failures for one chat turn.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("rate limit exceeded; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("upstream handshake failed: {0}")]
    UpstreamHandshake(String),
    #[error("upstream stream terminated: {0}")]
    UpstreamStream(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Interface-level errors carrying a correlation id and a user-safe
/// message. Detail stays in logs, never in responses.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("too many requests: {message}")]
    TooManyRequests { message: String, retry_after_secs: u64, correlation_id: String },
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::TooManyRequests { .. } => {
                "Too many assistant requests. Please wait a few seconds and try again."
            }
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::UpstreamUnavailable { .. } => {
                "The assistant is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::TooManyRequests { correlation_id, .. }
            | Self::BadRequest { correlation_id, .. }
            | Self::UpstreamUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl TurnError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        match self {
            Self::RateLimited { retry_after_secs } => InterfaceError::TooManyRequests {
                message: "assistant admission denied".to_owned(),
                retry_after_secs,
                correlation_id,
            },
            Self::UpstreamHandshake(message) | Self::UpstreamStream(message) => {
                InterfaceError::UpstreamUnavailable { message, correlation_id }
            }
            Self::Persistence(message) => InterfaceError::Internal { message, correlation_id },
            Self::Domain(error) => {
                InterfaceError::BadRequest { message: error.to_string(), correlation_id }
            }
        }
    }
}
