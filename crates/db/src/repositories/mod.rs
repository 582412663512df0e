use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use brokerdesk_core::domain::conversation::{
    ChatMessage, Conversation, ConversationId, MessageId, UserId,
};
use brokerdesk_core::domain::crm::{
    AppointmentRecord, ClientDetails, ClientRecord, ClientSearchResult, CreateAppointmentArgs,
    CreateClientArgs, CreateDealArgs, DealRecord, FinancialSummary, FinancialSummaryArgs,
    PolicySearchResult, SearchClientsArgs, SearchPoliciesArgs, UpdateDealArgs,
};

pub mod audit;
pub mod conversation;
pub mod crm;
pub mod memory;

pub use audit::SqlAuditSink;
pub use conversation::SqlConversationRepository;
pub use crm::SqlCrmStore;
pub use memory::{InMemoryConversationRepository, InMemoryCrmStore};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Maps unique-constraint violations to `Conflict` so callers can
    /// distinguish the single-in-progress-message invariant from plain
    /// database failures.
    pub fn from_sqlx(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(database_error) = &error {
            if database_error.is_unique_violation() {
                return Self::Conflict(database_error.to_string());
            }
        }
        Self::Database(error)
    }
}

/// Typed failure surface of the CRM data store, per tool operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create_conversation(&self, conversation: &Conversation)
        -> Result<(), RepositoryError>;

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn list_conversations(&self, owner: &UserId)
        -> Result<Vec<Conversation>, RepositoryError>;

    async fn list_messages(&self, id: &ConversationId)
        -> Result<Vec<ChatMessage>, RepositoryError>;

    /// Inserts a message and bumps the conversation's `updated_at`.
    /// Inserting a second in-progress message for the same conversation
    /// is a `Conflict`.
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), RepositoryError>;

    /// Appends a content delta to an in-progress message. Content only
    /// ever grows; finalized messages are not touched.
    async fn append_message_content(
        &self,
        id: &MessageId,
        delta: &str,
    ) -> Result<(), RepositoryError>;

    /// Clears the in-progress flag. `final_content` replaces the
    /// accumulated text when set (abort paths); `None` keeps it.
    /// Finalizing an already-final message is a no-op.
    async fn finalize_message(
        &self,
        id: &MessageId,
        final_content: Option<&str>,
    ) -> Result<(), RepositoryError>;
}

/// One operation per assistant tool against the external CRM store.
/// Each call is its own atomic unit; there is no cross-tool transaction
/// inside a streamed turn.
#[async_trait]
pub trait CrmStore: Send + Sync {
    async fn search_clients(
        &self,
        user: &UserId,
        args: SearchClientsArgs,
    ) -> Result<ClientSearchResult, StoreError>;

    async fn get_client_details(
        &self,
        user: &UserId,
        client_id: &str,
    ) -> Result<ClientDetails, StoreError>;

    async fn search_policies(
        &self,
        user: &UserId,
        args: SearchPoliciesArgs,
    ) -> Result<PolicySearchResult, StoreError>;

    async fn expiring_policies(
        &self,
        user: &UserId,
        days_ahead: u32,
    ) -> Result<PolicySearchResult, StoreError>;

    async fn financial_summary(
        &self,
        user: &UserId,
        args: FinancialSummaryArgs,
    ) -> Result<FinancialSummary, StoreError>;

    async fn appointments_on(
        &self,
        user: &UserId,
        date: NaiveDate,
    ) -> Result<Vec<AppointmentRecord>, StoreError>;

    async fn create_client(
        &self,
        user: &UserId,
        args: CreateClientArgs,
    ) -> Result<ClientRecord, StoreError>;

    async fn create_appointment(
        &self,
        user: &UserId,
        args: CreateAppointmentArgs,
    ) -> Result<AppointmentRecord, StoreError>;

    async fn find_deal(
        &self,
        user: &UserId,
        deal_id: &str,
    ) -> Result<Option<DealRecord>, StoreError>;

    async fn create_deal(
        &self,
        user: &UserId,
        args: CreateDealArgs,
    ) -> Result<DealRecord, StoreError>;

    async fn update_deal(
        &self,
        user: &UserId,
        args: UpdateDealArgs,
    ) -> Result<DealRecord, StoreError>;

    async fn move_deal_to_stage(
        &self,
        user: &UserId,
        deal_id: &str,
        stage_id: &str,
    ) -> Result<DealRecord, StoreError>;

    async fn delete_deal(&self, user: &UserId, deal_id: &str) -> Result<(), StoreError>;
}
