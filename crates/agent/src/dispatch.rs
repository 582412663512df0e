//! Tool dispatcher: resolves a wire invocation to a handler, executes
//! the domain operation, and wraps it in the audit envelope.
//!
//! Per invocation the flow is pending → executing → terminal; exactly
//! one terminal audit record is written per attempt, success or
//! failure. A failed tool never aborts the turn — the caller relays
//! the failed outcome and keeps streaming.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};

use brokerdesk_core::audit::{AuditOperation, ToolInvocationRecord};
use brokerdesk_core::domain::conversation::{ConversationId, MessageId, UserId};
use brokerdesk_core::domain::crm::{
    CreateAppointmentArgs, CreateClientArgs, CreateDealArgs, DeleteDealArgs, ExpiringPoliciesArgs,
    FinancialSummaryArgs, GetAppointmentsArgs, MoveDealArgs, SearchClientsArgs, SearchPoliciesArgs,
    UpdateDealArgs,
};
use brokerdesk_core::domain::tool::{ToolInvocation, ToolName, ToolOutcome};
use brokerdesk_db::repositories::{CrmStore, StoreError};

use crate::audit::AuditRecorder;

#[derive(Clone, Debug)]
pub struct TurnContext {
    pub caller: UserId,
    pub conversation_id: ConversationId,
    pub message_id: Option<MessageId>,
    pub correlation_id: String,
}

#[derive(Clone, Debug)]
pub struct ToolExecution {
    pub name: String,
    pub outcome: ToolOutcome,
    pub result: Value,
    pub error: Option<String>,
}

struct ToolRun {
    result: Value,
    entity_id: Option<String>,
    before: Option<Value>,
    after: Option<Value>,
}

#[derive(Deserialize)]
struct ClientDetailsArgs {
    client_id: String,
}

pub struct ToolDispatcher {
    store: Arc<dyn CrmStore>,
    audit: AuditRecorder,
}

impl ToolDispatcher {
    pub fn new(store: Arc<dyn CrmStore>, audit: AuditRecorder) -> Self {
        Self { store, audit }
    }

    pub async fn execute(&self, invocation: &ToolInvocation, ctx: &TurnContext) -> ToolExecution {
        let started = Instant::now();

        let Some(tool) = ToolName::parse(&invocation.name) else {
            let detail = format!("unknown tool `{}`", invocation.name);
            tracing::warn!(
                event_name = "assistant.tool.unknown",
                tool_name = %invocation.name,
                correlation_id = %ctx.correlation_id,
                "rejecting unknown tool at the dispatch boundary"
            );
            self.record_terminal(
                &invocation.name,
                AuditOperation::Read,
                None,
                None,
                None,
                None,
                Err(&detail),
                started,
                ctx,
            )
            .await;
            return ToolExecution {
                name: invocation.name.clone(),
                outcome: ToolOutcome::Failed,
                result: Value::Null,
                error: Some(detail),
            };
        };

        let run = self.run(tool, invocation.arguments.clone(), &ctx.caller).await;
        match run {
            Ok(run) => {
                self.record_terminal(
                    tool.as_str(),
                    tool.operation(),
                    Some(tool.entity_type()),
                    run.entity_id.as_deref(),
                    run.before.clone(),
                    run.after.clone(),
                    Ok(()),
                    started,
                    ctx,
                )
                .await;
                tracing::info!(
                    event_name = "assistant.tool.completed",
                    tool_name = %tool,
                    correlation_id = %ctx.correlation_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "tool execution completed"
                );
                ToolExecution {
                    name: tool.as_str().to_owned(),
                    outcome: ToolOutcome::Succeeded,
                    result: run.result,
                    error: None,
                }
            }
            Err(error) => {
                let detail = error.to_string();
                self.record_terminal(
                    tool.as_str(),
                    tool.operation(),
                    Some(tool.entity_type()),
                    None,
                    None,
                    None,
                    Err(&detail),
                    started,
                    ctx,
                )
                .await;
                tracing::warn!(
                    event_name = "assistant.tool.failed",
                    tool_name = %tool,
                    correlation_id = %ctx.correlation_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %detail,
                    "tool execution failed; turn continues"
                );
                ToolExecution {
                    name: tool.as_str().to_owned(),
                    outcome: ToolOutcome::Failed,
                    result: Value::Null,
                    error: Some(detail),
                }
            }
        }
    }

    /// Terminal failure without running the tool, e.g. when the
    /// per-turn tool budget is exhausted. Still audited as an attempt.
    pub async fn reject(
        &self,
        invocation: &ToolInvocation,
        ctx: &TurnContext,
        reason: &str,
    ) -> ToolExecution {
        let started = Instant::now();
        let operation =
            ToolName::parse(&invocation.name).map(|tool| tool.operation()).unwrap_or(AuditOperation::Read);

        self.record_terminal(
            &invocation.name,
            operation,
            None,
            None,
            None,
            None,
            Err(reason),
            started,
            ctx,
        )
        .await;

        ToolExecution {
            name: invocation.name.clone(),
            outcome: ToolOutcome::Failed,
            result: Value::Null,
            error: Some(reason.to_owned()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_terminal(
        &self,
        tool_name: &str,
        operation: AuditOperation,
        entity_type: Option<&'static str>,
        entity_id: Option<&str>,
        before: Option<Value>,
        after: Option<Value>,
        outcome: Result<(), &str>,
        started: Instant,
        ctx: &TurnContext,
    ) {
        let mut record = ToolInvocationRecord::new(
            ctx.caller.clone(),
            tool_name,
            operation,
            outcome.is_ok(),
            started.elapsed().as_millis() as u64,
        )
        .with_conversation(ctx.conversation_id.clone(), ctx.message_id.clone())
        .with_states(before, after);

        if let Some(entity_type) = entity_type {
            record = record.with_entity(entity_type, entity_id.map(str::to_owned));
        }
        if let Err(detail) = outcome {
            record = record.with_error_detail(detail);
        }

        self.audit.record(record).await;
    }

    async fn run(
        &self,
        tool: ToolName,
        arguments: Value,
        caller: &UserId,
    ) -> Result<ToolRun, StoreError> {
        match tool {
            ToolName::SearchClients => {
                let args: SearchClientsArgs = decode_args(arguments)?;
                let result = self.store.search_clients(caller, args).await?;
                let value = to_value(&result)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: None,
                    before: None,
                    after: Some(value),
                })
            }
            ToolName::GetClientDetails => {
                let args: ClientDetailsArgs = decode_args(arguments)?;
                let result = self.store.get_client_details(caller, &args.client_id).await?;
                let value = to_value(&result)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: Some(args.client_id),
                    before: None,
                    after: Some(value),
                })
            }
            ToolName::SearchPolicies => {
                let args: SearchPoliciesArgs = decode_args(arguments)?;
                let result = self.store.search_policies(caller, args).await?;
                let value = to_value(&result)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: None,
                    before: None,
                    after: Some(value),
                })
            }
            ToolName::GetExpiringPolicies => {
                let args: ExpiringPoliciesArgs = decode_args(arguments)?;
                let result = self.store.expiring_policies(caller, args.days).await?;
                let value = to_value(&result)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: None,
                    before: None,
                    after: Some(value),
                })
            }
            ToolName::GetFinancialSummary => {
                let args: FinancialSummaryArgs = decode_args(arguments)?;
                let result = self.store.financial_summary(caller, args).await?;
                let value = to_value(&result)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: None,
                    before: None,
                    after: Some(value),
                })
            }
            ToolName::GetAppointments => {
                let args: GetAppointmentsArgs = decode_args(arguments)?;
                let date = args.date.unwrap_or_else(|| chrono::Utc::now().date_naive());
                let result = self.store.appointments_on(caller, date).await?;
                let value = to_value(&result)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: None,
                    before: None,
                    after: Some(value),
                })
            }
            ToolName::CreateClient => {
                let args: CreateClientArgs = decode_args(arguments)?;
                let client = self.store.create_client(caller, args).await?;
                let value = to_value(&client)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: Some(client.id),
                    before: None,
                    after: Some(value),
                })
            }
            ToolName::CreateAppointment => {
                let args: CreateAppointmentArgs = decode_args(arguments)?;
                let appointment = self.store.create_appointment(caller, args).await?;
                let value = to_value(&appointment)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: Some(appointment.id),
                    before: None,
                    after: Some(value),
                })
            }
            ToolName::CreateDeal => {
                let args: CreateDealArgs = decode_args(arguments)?;
                let deal = self.store.create_deal(caller, args).await?;
                let value = to_value(&deal)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: Some(deal.id),
                    before: None,
                    after: Some(value),
                })
            }
            ToolName::UpdateDeal => {
                let args: UpdateDealArgs = decode_args(arguments)?;
                let before = self.snapshot_deal(caller, &args.deal_id).await?;
                let deal = self.store.update_deal(caller, args).await?;
                let value = to_value(&deal)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: Some(deal.id),
                    before: Some(before),
                    after: Some(value),
                })
            }
            ToolName::MoveDealToStage => {
                let args: MoveDealArgs = decode_args(arguments)?;
                let before = self.snapshot_deal(caller, &args.deal_id).await?;
                let deal =
                    self.store.move_deal_to_stage(caller, &args.deal_id, &args.stage_id).await?;
                let value = to_value(&deal)?;
                Ok(ToolRun {
                    result: value.clone(),
                    entity_id: Some(deal.id),
                    before: Some(before),
                    after: Some(value),
                })
            }
            ToolName::DeleteDeal => {
                let args: DeleteDealArgs = decode_args(arguments)?;
                let before = self.snapshot_deal(caller, &args.deal_id).await?;

                if !args.confirmed {
                    // No mutation without explicit confirmation; the
                    // assistant relays the question back to the user.
                    let result = json!({
                        "requires_confirmation": true,
                        "message": "Deleting a deal cannot be undone. Repeat the request with confirmed=true to proceed.",
                        "deal": before,
                    });
                    return Ok(ToolRun {
                        result,
                        entity_id: Some(args.deal_id),
                        before: Some(before),
                        after: None,
                    });
                }

                self.store.delete_deal(caller, &args.deal_id).await?;
                Ok(ToolRun {
                    result: json!({ "deleted": true, "deal_id": args.deal_id }),
                    entity_id: Some(args.deal_id),
                    before: Some(before),
                    after: None,
                })
            }
        }
    }

    async fn snapshot_deal(&self, caller: &UserId, deal_id: &str) -> Result<Value, StoreError> {
        let deal = self
            .store
            .find_deal(caller, deal_id)
            .await?
            .ok_or_else(|| StoreError::NotFound { entity: "deal", id: deal_id.to_owned() })?;
        to_value(&deal)
    }
}

fn decode_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, StoreError> {
    // Providers send `null` instead of `{}` for argument-free calls.
    let arguments =
        if arguments.is_null() { Value::Object(serde_json::Map::new()) } else { arguments };
    serde_json::from_value(arguments)
        .map_err(|error| StoreError::Validation(format!("invalid arguments: {error}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|error| StoreError::Decode(error.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use brokerdesk_core::audit::InMemoryAuditSink;
    use brokerdesk_core::domain::conversation::{ConversationId, UserId};
    use brokerdesk_core::domain::tool::{ToolInvocation, ToolOutcome};
    use brokerdesk_db::repositories::InMemoryCrmStore;

    use super::{ToolDispatcher, TurnContext};
    use crate::audit::AuditRecorder;

    fn context() -> TurnContext {
        TurnContext {
            caller: UserId("user-1".to_owned()),
            conversation_id: ConversationId("conv-1".to_owned()),
            message_id: None,
            correlation_id: "turn-1".to_owned(),
        }
    }

    fn dispatcher() -> (ToolDispatcher, InMemoryCrmStore, InMemoryAuditSink) {
        let store = InMemoryCrmStore::with_pipeline(&UserId("user-1".to_owned()));
        let sink = InMemoryAuditSink::default();
        let dispatcher =
            ToolDispatcher::new(Arc::new(store.clone()), AuditRecorder::new(Arc::new(sink.clone())));
        (dispatcher, store, sink)
    }

    #[tokio::test]
    async fn successful_move_records_before_and_after_snapshots() {
        let (dispatcher, _store, sink) = dispatcher();

        let execution = dispatcher
            .execute(
                &ToolInvocation::new(
                    "move_deal_to_stage",
                    json!({ "deal_id": "deal-1", "stage_id": "stage-won" }),
                ),
                &context(),
            )
            .await;

        assert_eq!(execution.outcome, ToolOutcome::Succeeded);
        let records = sink.records();
        assert_eq!(records.len(), 1, "exactly one terminal record per attempt");
        let record = &records[0];
        assert!(record.success);
        assert_eq!(record.tool_name, "move_deal_to_stage");
        assert_eq!(record.entity_id.as_deref(), Some("deal-1"));
        assert_eq!(record.before_state.as_ref().unwrap()["stage_id"], "stage-new");
        assert_eq!(record.after_state.as_ref().unwrap()["stage_id"], "stage-won");
    }

    #[tokio::test]
    async fn failed_tool_records_error_detail_and_does_not_abort() {
        let (dispatcher, _store, sink) = dispatcher();

        let execution = dispatcher
            .execute(
                &ToolInvocation::new(
                    "create_deal",
                    json!({ "stage_id": "stage-missing", "title": "No stage" }),
                ),
                &context(),
            )
            .await;

        assert_eq!(execution.outcome, ToolOutcome::Failed);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].error_detail.as_ref().unwrap().contains("stage"));
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_and_still_audited() {
        let (dispatcher, _store, sink) = dispatcher();

        let execution = dispatcher
            .execute(&ToolInvocation::new("drop_all_tables", json!({})), &context())
            .await;

        assert_eq!(execution.outcome, ToolOutcome::Failed);
        assert!(execution.error.as_ref().unwrap().contains("unknown tool"));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tool_name, "drop_all_tables");
        assert!(!records[0].success);
    }

    #[tokio::test]
    async fn invalid_arguments_fail_as_validation() {
        let (dispatcher, _store, sink) = dispatcher();

        let execution = dispatcher
            .execute(&ToolInvocation::new("create_client", json!({ "name": "Solo" })), &context())
            .await;

        assert_eq!(execution.outcome, ToolOutcome::Failed);
        assert!(execution.error.as_ref().unwrap().contains("invalid arguments"));
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn unconfirmed_delete_keeps_the_deal() {
        let (dispatcher, store, sink) = dispatcher();

        let execution = dispatcher
            .execute(&ToolInvocation::new("delete_deal", json!({ "deal_id": "deal-1" })), &context())
            .await;

        assert_eq!(execution.outcome, ToolOutcome::Succeeded);
        assert_eq!(execution.result["requires_confirmation"], true);
        assert_eq!(store.deals_snapshot().len(), 1, "deal must survive unconfirmed delete");
        assert!(sink.records()[0].after_state.is_none());

        let execution = dispatcher
            .execute(
                &ToolInvocation::new("delete_deal", json!({ "deal_id": "deal-1", "confirmed": true })),
                &context(),
            )
            .await;
        assert_eq!(execution.outcome, ToolOutcome::Succeeded);
        assert!(store.deals_snapshot().is_empty());
    }

    #[tokio::test]
    async fn retries_produce_new_records_not_updates() {
        let (dispatcher, _store, sink) = dispatcher();
        let invocation = ToolInvocation::new(
            "create_deal",
            json!({ "stage_id": "stage-missing", "title": "Retry me" }),
        );

        dispatcher.execute(&invocation, &context()).await;
        dispatcher.execute(&invocation, &context()).await;

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].record_id, records[1].record_id);
    }

    #[tokio::test]
    async fn reject_audits_without_touching_the_store() {
        let (dispatcher, store, sink) = dispatcher();

        let execution = dispatcher
            .reject(
                &ToolInvocation::new("create_deal", json!({})),
                &context(),
                "tool iteration limit reached",
            )
            .await;

        assert_eq!(execution.outcome, ToolOutcome::Failed);
        assert_eq!(store.deals_snapshot().len(), 1);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].error_detail.as_deref(),
            Some("tool iteration limit reached")
        );
    }
}
