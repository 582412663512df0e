use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use brokerdesk_agent::{AuditRecorder, HttpCompletionClient, StreamProducer, ToolDispatcher};
use brokerdesk_core::audit::AuditSink;
use brokerdesk_core::config::{AppConfig, ConfigError};
use brokerdesk_core::ratelimit::{InMemoryAdmissionStore, SlidingWindowLimiter};
use brokerdesk_db::repositories::{
    ConversationRepository, CrmStore, SqlAuditSink, SqlConversationRepository, SqlCrmStore,
};
use brokerdesk_db::{connect_with_settings, migrations, DbPool};

use crate::assistant::AssistantState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub assistant_state: AssistantState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

/// Wires the pipeline from an already-loaded configuration. Every
/// service is constructed once here and injected by reference; there
/// are no ambient singletons to reach for later.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let conversations: Arc<dyn ConversationRepository> =
        Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let store: Arc<dyn CrmStore> = Arc::new(SqlCrmStore::new(db_pool.clone()));
    let audit_sink: Arc<dyn AuditSink> = Arc::new(SqlAuditSink::new(db_pool.clone()));

    let limiter = Arc::new(SlidingWindowLimiter::new(
        Arc::new(InMemoryAdmissionStore::default()),
        config.assistant.rate_limit_max_admissions,
        Duration::from_secs(config.assistant.rate_limit_window_secs),
    ));
    let dispatcher = Arc::new(ToolDispatcher::new(store, AuditRecorder::new(audit_sink)));
    let llm = Arc::new(HttpCompletionClient::from_config(&config.llm));
    let producer = Arc::new(StreamProducer::new(
        llm,
        dispatcher,
        conversations.clone(),
        limiter,
        config.assistant.max_tool_iterations,
    ));

    Ok(Application {
        config,
        db_pool,
        assistant_state: AssistantState { producer, conversations },
    })
}
