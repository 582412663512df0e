//! Assistant HTTP surface.
//!
//! `POST /api/assistant/chat` runs one turn and answers with the
//! multiplexed SSE stream; admission and handshake failures are
//! reported as plain JSON errors before any streaming starts.
//! Conversation history is exposed read-only for the UI sidebar.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use brokerdesk_agent::{StreamProducer, TurnRequest};
use brokerdesk_core::domain::conversation::{ConversationId, UserId};
use brokerdesk_core::errors::{InterfaceError, TurnError};
use brokerdesk_db::repositories::ConversationRepository;

#[derive(Clone)]
pub struct AssistantState {
    pub producer: Arc<StreamProducer>,
    pub conversations: Arc<dyn ConversationRepository>,
}

pub fn router(state: AssistantState) -> Router {
    Router::new()
        .route("/api/assistant/chat", post(chat))
        .route("/api/assistant/conversations", get(list_conversations))
        .route("/api/assistant/conversations/{id}/messages", get(list_messages))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    conversation_id: Option<String>,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    code: &'static str,
    correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

fn caller_from_headers(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| UserId(value.to_owned()))
}

fn missing_caller_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: "The request could not be processed. Check inputs and try again.",
            code: "MISSING_USER",
            correlation_id: Uuid::new_v4().to_string(),
            retry_after_secs: None,
        }),
    )
        .into_response()
}

fn turn_error_response(error: TurnError) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    let interface = error.into_interface(correlation_id.clone());

    let (status, code, retry_after_secs) = match &interface {
        InterfaceError::TooManyRequests { retry_after_secs, .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED", Some(*retry_after_secs))
        }
        InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "BAD_REQUEST", None),
        InterfaceError::UpstreamUnavailable { .. } => {
            (StatusCode::BAD_GATEWAY, "UPSTREAM_UNAVAILABLE", None)
        }
        InterfaceError::Internal { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
        }
    };

    tracing::warn!(
        event_name = "assistant.http.turn_rejected",
        correlation_id = %correlation_id,
        code,
        detail = %interface,
        "chat turn rejected before streaming"
    );

    let mut response = (
        status,
        Json(ErrorBody {
            error: interface.user_message(),
            code,
            correlation_id,
            retry_after_secs,
        }),
    )
        .into_response();
    if let Some(retry_after) = retry_after_secs {
        if let Ok(value) = retry_after.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

async fn chat(
    State(state): State<AssistantState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let Some(caller) = caller_from_headers(&headers) else {
        return missing_caller_response();
    };
    if request.message.trim().is_empty() {
        return turn_error_response(TurnError::Domain(
            brokerdesk_core::errors::DomainError::InvariantViolation(
                "message must not be empty".to_owned(),
            ),
        ));
    }

    let turn = state
        .producer
        .begin_turn(TurnRequest {
            caller,
            conversation_id: request.conversation_id.map(ConversationId),
            message: request.message,
        })
        .await;

    match turn {
        Ok(turn) => {
            let conversation_id = turn.conversation_id.0.clone();
            let frames = ReceiverStream::new(turn.frames)
                .map(|frame| Ok::<_, Infallible>(frame.into_bytes()));

            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(frames))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            if let Ok(value) = conversation_id.parse() {
                response.headers_mut().insert("x-conversation-id", value);
            }
            response
        }
        Err(error) => turn_error_response(error),
    }
}

async fn list_conversations(
    State(state): State<AssistantState>,
    headers: HeaderMap,
) -> Response {
    let Some(caller) = caller_from_headers(&headers) else {
        return missing_caller_response();
    };

    match state.conversations.list_conversations(&caller).await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(error) => turn_error_response(TurnError::Persistence(error.to_string())),
    }
}

async fn list_messages(
    State(state): State<AssistantState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(caller) = caller_from_headers(&headers) else {
        return missing_caller_response();
    };
    let conversation_id = ConversationId(id);

    let conversation = match state.conversations.find_conversation(&conversation_id).await {
        Ok(conversation) => conversation,
        Err(error) => return turn_error_response(TurnError::Persistence(error.to_string())),
    };
    // Not found and not owned are indistinguishable on purpose.
    if conversation.map(|conversation| conversation.owner) != Some(caller) {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not found" })))
            .into_response();
    }

    match state.conversations.list_messages(&conversation_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(error) => turn_error_response(TurnError::Persistence(error.to_string())),
    }
}
