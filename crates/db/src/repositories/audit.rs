use async_trait::async_trait;

use brokerdesk_core::audit::{AuditSink, AuditSinkError, ToolInvocationRecord};

use crate::DbPool;

/// Append-only SQL sink for tool invocation records. Write-only from
/// this subsystem's point of view; the compliance surface reads the
/// table directly.
pub struct SqlAuditSink {
    pool: DbPool,
}

impl SqlAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn state_json(state: &Option<serde_json::Value>) -> Result<Option<String>, AuditSinkError> {
    state
        .as_ref()
        .map(|value| serde_json::to_string(value))
        .transpose()
        .map_err(|error| AuditSinkError::Write(error.to_string()))
}

#[async_trait]
impl AuditSink for SqlAuditSink {
    async fn append(&self, record: ToolInvocationRecord) -> Result<(), AuditSinkError> {
        sqlx::query(
            "INSERT INTO ai_operations_log \
             (id, user_id, conversation_id, message_id, tool_name, operation, entity_type, \
              entity_id, before_state, after_state, success, error_detail, duration_ms, \
              recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&record.record_id)
        .bind(&record.user_id.0)
        .bind(record.conversation_id.as_ref().map(|id| id.0.as_str()))
        .bind(record.message_id.as_ref().map(|id| id.0.as_str()))
        .bind(&record.tool_name)
        .bind(record.operation.as_str())
        .bind(record.entity_type.as_deref())
        .bind(record.entity_id.as_deref())
        .bind(state_json(&record.before_state)?)
        .bind(state_json(&record.after_state)?)
        .bind(i64::from(record.success))
        .bind(record.error_detail.as_deref())
        .bind(record.duration_ms as i64)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|error| AuditSinkError::Write(error.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::Row;

    use brokerdesk_core::audit::{AuditOperation, AuditSink, ToolInvocationRecord};
    use brokerdesk_core::domain::conversation::{ConversationId, UserId};

    use super::SqlAuditSink;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn appends_terminal_records_with_snapshots() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let sink = SqlAuditSink::new(pool.clone());

        sink.append(
            ToolInvocationRecord::new(
                UserId("user-1".to_owned()),
                "create_deal",
                AuditOperation::Create,
                true,
                87,
            )
            .with_conversation(ConversationId("conv-1".to_owned()), None)
            .with_entity("deal", Some("deal-1".to_owned()))
            .with_states(None, Some(json!({ "title": "Acme renewal" }))),
        )
        .await
        .expect("append success record");

        sink.append(
            ToolInvocationRecord::new(
                UserId("user-1".to_owned()),
                "create_deal",
                AuditOperation::Create,
                false,
                12,
            )
            .with_error_detail("stage not found: stage-9"),
        )
        .await
        .expect("append failure record");

        let rows = sqlx::query(
            "SELECT tool_name, success, error_detail, after_state, duration_ms \
             FROM ai_operations_log ORDER BY recorded_at, success DESC",
        )
        .fetch_all(&pool)
        .await
        .expect("read back for assertion");
        assert_eq!(rows.len(), 2);

        let success = rows.iter().find(|row| row.get::<i64, _>("success") == 1).expect("success");
        assert_eq!(success.get::<String, _>("tool_name"), "create_deal");
        assert!(success.get::<Option<String>, _>("after_state").is_some());

        let failure = rows.iter().find(|row| row.get::<i64, _>("success") == 0).expect("failure");
        assert_eq!(
            failure.get::<Option<String>, _>("error_detail").as_deref(),
            Some("stage not found: stage-9")
        );
    }
}
