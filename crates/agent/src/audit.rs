use std::sync::Arc;

use brokerdesk_core::audit::{AuditSink, ToolInvocationRecord};

/// Writes terminal audit records for tool invocations.
///
/// Audit failures are logged and swallowed: a successful domain
/// operation must never be turned into a user-facing error by the
/// compliance write.
#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn record(&self, record: ToolInvocationRecord) {
        let tool_name = record.tool_name.clone();
        let correlation_id =
            record.conversation_id.as_ref().map(|id| id.0.clone()).unwrap_or_default();

        if let Err(error) = self.sink.append(record).await {
            tracing::warn!(
                event_name = "assistant.audit.write_failed",
                tool_name = %tool_name,
                correlation_id = %correlation_id,
                error = %error,
                "audit write failed; tool outcome is unaffected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use brokerdesk_core::audit::{
        AuditOperation, AuditSink, AuditSinkError, InMemoryAuditSink, ToolInvocationRecord,
    };
    use brokerdesk_core::domain::conversation::UserId;

    use super::AuditRecorder;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn append(&self, _record: ToolInvocationRecord) -> Result<(), AuditSinkError> {
            Err(AuditSinkError::Write("disk full".to_owned()))
        }
    }

    fn record() -> ToolInvocationRecord {
        ToolInvocationRecord::new(
            UserId("user-1".to_owned()),
            "create_deal",
            AuditOperation::Create,
            true,
            5,
        )
    }

    #[tokio::test]
    async fn records_reach_the_sink() {
        let sink = InMemoryAuditSink::default();
        let recorder = AuditRecorder::new(Arc::new(sink.clone()));
        recorder.record(record()).await;
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed() {
        let recorder = AuditRecorder::new(Arc::new(FailingSink));
        // Must not panic or propagate.
        recorder.record(record()).await;
    }
}
