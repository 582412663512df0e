use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::conversation::{ConversationId, MessageId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOperation {
    Read,
    Create,
    Update,
    Delete,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "read" => Some(Self::Read),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Append-only audit envelope for one tool invocation attempt.
///
/// Exactly one record exists per attempt; retries produce new records.
/// References to the conversation/message are by id only so the record
/// outlives conversation deletion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub record_id: String,
    pub user_id: UserId,
    pub conversation_id: Option<ConversationId>,
    pub message_id: Option<MessageId>,
    pub tool_name: String,
    pub operation: AuditOperation,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub success: bool,
    pub error_detail: Option<String>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl ToolInvocationRecord {
    pub fn new(
        user_id: UserId,
        tool_name: impl Into<String>,
        operation: AuditOperation,
        success: bool,
        duration_ms: u64,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4().to_string(),
            user_id,
            conversation_id: None,
            message_id: None,
            tool_name: tool_name.into(),
            operation,
            entity_type: None,
            entity_id: None,
            before_state: None,
            after_state: None,
            success,
            error_detail: None,
            duration_ms,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_conversation(
        mut self,
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
    ) -> Self {
        self.conversation_id = Some(conversation_id);
        self.message_id = message_id;
        self
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: Option<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = entity_id;
        self
    }

    pub fn with_states(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before_state = before;
        self.after_state = after;
        self
    }

    pub fn with_error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum AuditSinkError {
    #[error("audit sink write failed: {0}")]
    Write(String),
}

/// Append-only sink for tool invocation records. Never read back by this
/// subsystem; read access is an external compliance concern.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: ToolInvocationRecord) -> Result<(), AuditSinkError>;
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    records: Arc<Mutex<Vec<ToolInvocationRecord>>>,
}

impl InMemoryAuditSink {
    pub fn records(&self) -> Vec<ToolInvocationRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, record: ToolInvocationRecord) -> Result<(), AuditSinkError> {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
        Ok(())
    }
}
