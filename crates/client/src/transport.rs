use futures_util::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;

use brokerdesk_core::domain::conversation::UserId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("server rejected the turn ({status}): {detail}")]
    Rejected { status: u16, detail: String, retry_after_secs: Option<u64> },
    #[error("transport read failed: {0}")]
    Read(String),
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatTurnRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub message: String,
}

/// HTTP transport for the assistant chat endpoint. Opens one POST per
/// turn and exposes the response body as a chunk stream; dropping the
/// stream aborts the connection, which is how the consumer's hard
/// timeout and cancellation release the turn.
pub struct HttpChatTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }

    pub async fn open_turn(
        &self,
        caller: &UserId,
        request: &ChatTurnRequest,
    ) -> Result<impl Stream<Item = Result<Vec<u8>, TransportError>> + Unpin, TransportError> {
        let url = format!("{}/api/assistant/chat", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("x-user-id", caller.0.as_str())
            .json(request)
            .send()
            .await
            .map_err(|error| TransportError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok());
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                detail,
                retry_after_secs,
            });
        }

        Ok(response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|error| TransportError::Read(error.to_string()))
        }))
    }
}
