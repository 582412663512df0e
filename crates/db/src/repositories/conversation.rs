use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use brokerdesk_core::domain::conversation::{
    ChatMessage, Conversation, ConversationId, MessageId, MessageRole, UserId,
};

use super::{ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn conversation_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, RepositoryError> {
    Ok(Conversation {
        id: ConversationId(row.get::<String, _>("id")),
        owner: UserId(row.get::<String, _>("user_id")),
        title: row.get::<String, _>("title"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChatMessage, RepositoryError> {
    let raw_role = row.get::<String, _>("role");
    let role = MessageRole::parse(&raw_role)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role `{raw_role}`")))?;

    Ok(ChatMessage {
        id: MessageId(row.get::<String, _>("id")),
        conversation_id: ConversationId(row.get::<String, _>("conversation_id")),
        role,
        content: row.get::<String, _>("content"),
        in_progress: row.get::<i64, _>("in_progress") != 0,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    })
}

#[async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO ai_conversations (id, user_id, title, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&conversation.id.0)
        .bind(&conversation.owner.0)
        .bind(&conversation.title)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;
        Ok(())
    }

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at \
             FROM ai_conversations WHERE id = ?1",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn list_conversations(
        &self,
        owner: &UserId,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at \
             FROM ai_conversations WHERE user_id = ?1 ORDER BY updated_at DESC",
        )
        .bind(&owner.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(conversation_from_row).collect()
    }

    async fn list_messages(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, in_progress, created_at \
             FROM ai_messages WHERE conversation_id = ?1 ORDER BY created_at, id",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO ai_messages (id, conversation_id, role, content, in_progress, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&message.id.0)
        .bind(&message.conversation_id.0)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(i64::from(message.in_progress))
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        sqlx::query("UPDATE ai_conversations SET updated_at = ?1 WHERE id = ?2")
            .bind(message.created_at)
            .bind(&message.conversation_id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn append_message_content(
        &self,
        id: &MessageId,
        delta: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE ai_messages SET content = content || ?1 \
             WHERE id = ?2 AND in_progress = 1",
        )
        .bind(delta)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_message(
        &self,
        id: &MessageId,
        final_content: Option<&str>,
    ) -> Result<(), RepositoryError> {
        // Both updates are guarded on in_progress, so a racing second
        // finalization is a no-op.
        match final_content {
            Some(content) => {
                sqlx::query(
                    "UPDATE ai_messages SET content = ?1, in_progress = 0 \
                     WHERE id = ?2 AND in_progress = 1",
                )
                .bind(content)
                .bind(&id.0)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("UPDATE ai_messages SET in_progress = 0 WHERE id = ?1 AND in_progress = 1")
                    .bind(&id.0)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}
