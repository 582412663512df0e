use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One chat thread owned by a single user. Mutated only by appending
/// messages; deletion belongs to the external CRUD surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub owner: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(owner: UserId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: ConversationId::generate(),
            owner,
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derives a conversation title from the first user message.
pub fn title_from_first_message(text: &str) -> String {
    const MAX_TITLE_CHARS: usize = 60;

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "New conversation".to_string();
    }
    if collapsed.chars().count() <= MAX_TITLE_CHARS {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(MAX_TITLE_CHARS).collect();
    format!("{}…", truncated.trim_end())
}

/// A single message within a conversation.
///
/// Assistant messages are created in-progress and grow by monotonic
/// appends until finalized; within a conversation at most one message
/// is in-progress at a time (enforced by the persistence layer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub in_progress: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(conversation_id: ConversationId, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            role: MessageRole::User,
            content: content.into(),
            in_progress: false,
            created_at: now,
        }
    }

    pub fn assistant_in_progress(conversation_id: ConversationId, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            role: MessageRole::Assistant,
            content: String::new(),
            in_progress: true,
            created_at: now,
        }
    }

    /// Appends a content delta. Content only ever grows while streaming.
    pub fn append(&mut self, delta: &str) -> Result<(), DomainError> {
        if !self.in_progress {
            return Err(DomainError::MessageFinalized { message_id: self.id.0.clone() });
        }
        self.content.push_str(delta);
        Ok(())
    }

    /// Closes the message. Idempotent: finalizing twice is a no-op.
    pub fn finalize(&mut self) {
        self.in_progress = false;
    }

    /// Replaces the accumulated content with a terminal notice.
    ///
    /// Reserved for abort paths where partial content must not be shown
    /// (hard timeout); ordinary completion never rewrites content.
    pub fn finalize_with_notice(&mut self, notice: impl Into<String>) {
        if self.in_progress {
            self.content = notice.into();
        }
        self.in_progress = false;
    }
}
