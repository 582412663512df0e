//! In-memory repository fakes for tests and the smoke command.
//!
//! Same contracts as the SQL implementations, backed by mutex-guarded
//! vectors. Deterministic and dependency-free so agent and server tests
//! can run without a database file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use brokerdesk_core::domain::conversation::{
    ChatMessage, Conversation, ConversationId, MessageId, UserId,
};
use brokerdesk_core::domain::crm::{
    AppointmentRecord, ClientDetails, ClientRecord, ClientSearchResult, CreateAppointmentArgs,
    CreateClientArgs, CreateDealArgs, DealRecord, FinancialSummary, FinancialSummaryArgs,
    PolicyRecord, PolicySearchResult, SearchClientsArgs, SearchPoliciesArgs, UpdateDealArgs,
};

use super::{ConversationRepository, CrmStore, RepositoryError, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone, Default)]
pub struct InMemoryConversationRepository {
    state: Arc<Mutex<ConversationState>>,
}

#[derive(Default)]
struct ConversationState {
    conversations: Vec<Conversation>,
    messages: Vec<ChatMessage>,
}

impl InMemoryConversationRepository {
    pub fn messages_snapshot(&self) -> Vec<ChatMessage> {
        lock(&self.state).messages.clone()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), RepositoryError> {
        lock(&self.state).conversations.push(conversation.clone());
        Ok(())
    }

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(lock(&self.state).conversations.iter().find(|c| &c.id == id).cloned())
    }

    async fn list_conversations(
        &self,
        owner: &UserId,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let mut conversations: Vec<_> = lock(&self.state)
            .conversations
            .iter()
            .filter(|conversation| &conversation.owner == owner)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn list_messages(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let mut messages: Vec<_> = lock(&self.state)
            .messages
            .iter()
            .filter(|message| &message.conversation_id == id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        let mut state = lock(&self.state);
        if message.in_progress
            && state
                .messages
                .iter()
                .any(|existing| {
                    existing.conversation_id == message.conversation_id && existing.in_progress
                })
        {
            return Err(RepositoryError::Conflict(
                "conversation already has an in-progress message".to_owned(),
            ));
        }
        if let Some(conversation) =
            state.conversations.iter_mut().find(|c| c.id == message.conversation_id)
        {
            conversation.updated_at = message.created_at;
        }
        state.messages.push(message.clone());
        Ok(())
    }

    async fn append_message_content(
        &self,
        id: &MessageId,
        delta: &str,
    ) -> Result<(), RepositoryError> {
        let mut state = lock(&self.state);
        if let Some(message) =
            state.messages.iter_mut().find(|message| &message.id == id && message.in_progress)
        {
            message.content.push_str(delta);
        }
        Ok(())
    }

    async fn finalize_message(
        &self,
        id: &MessageId,
        final_content: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut state = lock(&self.state);
        if let Some(message) =
            state.messages.iter_mut().find(|message| &message.id == id && message.in_progress)
        {
            if let Some(content) = final_content {
                message.content = content.to_owned();
            }
            message.in_progress = false;
        }
        Ok(())
    }
}

#[derive(Default)]
struct CrmState {
    clients: Vec<ClientRecord>,
    client_owner: HashMap<String, String>,
    policies: Vec<(String, PolicyRecord)>,
    stages: Vec<(String, String, String)>,
    deals: Vec<(String, DealRecord)>,
    appointments: Vec<(String, AppointmentRecord)>,
    income: Vec<(String, NaiveDate, Decimal)>,
    expenses: Vec<(String, NaiveDate, Decimal)>,
}

/// In-memory CRM store pre-seeded with one pipeline. Tuples carry the
/// owning user id first; tenancy filtering mirrors the SQL store.
#[derive(Clone, Default)]
pub struct InMemoryCrmStore {
    state: Arc<Mutex<CrmState>>,
}

impl InMemoryCrmStore {
    /// A deterministic baseline: two stages and one deal for `user`.
    pub fn with_pipeline(user: &UserId) -> Self {
        let store = Self::default();
        {
            let mut state = lock(&store.state);
            state.stages.push((user.0.clone(), "stage-new".to_owned(), "New".to_owned()));
            state.stages.push((user.0.clone(), "stage-won".to_owned(), "Won".to_owned()));
            state.deals.push((
                user.0.clone(),
                DealRecord {
                    id: "deal-1".to_owned(),
                    client_id: None,
                    stage_id: "stage-new".to_owned(),
                    stage_name: "New".to_owned(),
                    title: "Initech expansion".to_owned(),
                    value: Decimal::new(120_000, 2),
                    position: 1,
                    expected_close_date: None,
                    notes: None,
                },
            ));
        }
        store
    }

    pub fn deals_snapshot(&self) -> Vec<DealRecord> {
        lock(&self.state).deals.iter().map(|(_, deal)| deal.clone()).collect()
    }
}

#[async_trait]
impl CrmStore for InMemoryCrmStore {
    async fn search_clients(
        &self,
        user: &UserId,
        args: SearchClientsArgs,
    ) -> Result<ClientSearchResult, StoreError> {
        let state = lock(&self.state);
        let matches: Vec<_> = state
            .clients
            .iter()
            .filter(|client| {
                state.client_owner.get(&client.id).is_some_and(|owner| owner == &user.0)
            })
            .filter(|client| {
                args.query.as_ref().map_or(true, |query| {
                    client.name.contains(query.as_str())
                        || client.email.contains(query.as_str())
                        || client.phone.contains(query.as_str())
                })
            })
            .filter(|client| args.status.as_ref().map_or(true, |status| &client.status == status))
            .cloned()
            .collect();

        let total_count = matches.len() as i64;
        let clients = matches.into_iter().take(args.effective_limit() as usize).collect();
        Ok(ClientSearchResult { total_count, clients })
    }

    async fn get_client_details(
        &self,
        user: &UserId,
        client_id: &str,
    ) -> Result<ClientDetails, StoreError> {
        let state = lock(&self.state);
        let owned = state.client_owner.get(client_id).is_some_and(|owner| owner == &user.0);
        let client = state
            .clients
            .iter()
            .find(|client| client.id == client_id && owned)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { entity: "client", id: client_id.to_owned() })?;

        let policies = state
            .policies
            .iter()
            .filter(|(owner, policy)| owner == &user.0 && policy.client_id == client_id)
            .map(|(_, policy)| policy.clone())
            .collect();
        Ok(ClientDetails { client, policies })
    }

    async fn search_policies(
        &self,
        user: &UserId,
        args: SearchPoliciesArgs,
    ) -> Result<PolicySearchResult, StoreError> {
        let state = lock(&self.state);
        let matches: Vec<_> = state
            .policies
            .iter()
            .filter(|(owner, _)| owner == &user.0)
            .map(|(_, policy)| policy)
            .filter(|policy| {
                args.client_id.as_ref().map_or(true, |client_id| &policy.client_id == client_id)
            })
            .filter(|policy| args.status.as_ref().map_or(true, |status| &policy.status == status))
            .filter(|policy| {
                args.line_of_business
                    .as_ref()
                    .map_or(true, |lob| policy.line_of_business.contains(lob.as_str()))
            })
            .cloned()
            .collect();

        let total_count = matches.len() as i64;
        let policies = matches.into_iter().take(args.effective_limit() as usize).collect();
        Ok(PolicySearchResult { total_count, policies })
    }

    async fn expiring_policies(
        &self,
        user: &UserId,
        days_ahead: u32,
    ) -> Result<PolicySearchResult, StoreError> {
        let today = Utc::now().date_naive();
        let horizon = today + Duration::days(i64::from(days_ahead));
        let state = lock(&self.state);

        let policies: Vec<_> = state
            .policies
            .iter()
            .filter(|(owner, policy)| {
                owner == &user.0
                    && policy.status == "active"
                    && policy.expiration_date >= today
                    && policy.expiration_date <= horizon
            })
            .map(|(_, policy)| policy.clone())
            .collect();
        Ok(PolicySearchResult { total_count: policies.len() as i64, policies })
    }

    async fn financial_summary(
        &self,
        user: &UserId,
        args: FinancialSummaryArgs,
    ) -> Result<FinancialSummary, StoreError> {
        let today = Utc::now().date_naive();
        let period_start = args.start_date.unwrap_or(today - Duration::days(30));
        let period_end = args.end_date.unwrap_or(today);
        let in_period = |date: &NaiveDate| *date >= period_start && *date <= period_end;
        let state = lock(&self.state);

        let total_income: Decimal = state
            .income
            .iter()
            .filter(|(owner, date, _)| owner == &user.0 && in_period(date))
            .map(|(_, _, amount)| *amount)
            .sum();
        let total_expenses: Decimal = state
            .expenses
            .iter()
            .filter(|(owner, date, _)| owner == &user.0 && in_period(date))
            .map(|(_, _, amount)| *amount)
            .sum();
        let entry_count = state
            .income
            .iter()
            .chain(state.expenses.iter())
            .filter(|(owner, date, _)| owner == &user.0 && in_period(date))
            .count() as i64;

        Ok(FinancialSummary {
            period_start,
            period_end,
            total_income,
            total_expenses,
            net_balance: total_income - total_expenses,
            entry_count,
        })
    }

    async fn appointments_on(
        &self,
        user: &UserId,
        date: NaiveDate,
    ) -> Result<Vec<AppointmentRecord>, StoreError> {
        let state = lock(&self.state);
        Ok(state
            .appointments
            .iter()
            .filter(|(owner, appointment)| owner == &user.0 && appointment.date == date)
            .map(|(_, appointment)| appointment.clone())
            .collect())
    }

    async fn create_client(
        &self,
        user: &UserId,
        args: CreateClientArgs,
    ) -> Result<ClientRecord, StoreError> {
        args.validate().map_err(StoreError::Validation)?;
        let client = ClientRecord {
            id: Uuid::new_v4().to_string(),
            name: args.name.trim().to_owned(),
            phone: args.phone.trim().to_owned(),
            email: args.email.trim().to_ascii_lowercase(),
            cpf_cnpj: args.cpf_cnpj,
            status: "active".to_owned(),
            notes: args.notes,
            created_at: Utc::now(),
        };
        let mut state = lock(&self.state);
        state.client_owner.insert(client.id.clone(), user.0.clone());
        state.clients.push(client.clone());
        Ok(client)
    }

    async fn create_appointment(
        &self,
        user: &UserId,
        args: CreateAppointmentArgs,
    ) -> Result<AppointmentRecord, StoreError> {
        args.validate().map_err(StoreError::Validation)?;
        let appointment = AppointmentRecord {
            id: Uuid::new_v4().to_string(),
            client_id: args.client_id,
            title: args.title.trim().to_owned(),
            date: args.date,
            time: args.time,
            status: "pending".to_owned(),
            notes: args.notes,
        };
        lock(&self.state).appointments.push((user.0.clone(), appointment.clone()));
        Ok(appointment)
    }

    async fn find_deal(
        &self,
        user: &UserId,
        deal_id: &str,
    ) -> Result<Option<DealRecord>, StoreError> {
        Ok(lock(&self.state)
            .deals
            .iter()
            .find(|(owner, deal)| owner == &user.0 && deal.id == deal_id)
            .map(|(_, deal)| deal.clone()))
    }

    async fn create_deal(
        &self,
        user: &UserId,
        args: CreateDealArgs,
    ) -> Result<DealRecord, StoreError> {
        args.validate().map_err(StoreError::Validation)?;
        let mut state = lock(&self.state);

        let stage_name = state
            .stages
            .iter()
            .find(|(owner, id, _)| owner == &user.0 && id == &args.stage_id)
            .map(|(_, _, name)| name.clone())
            .ok_or_else(|| StoreError::NotFound { entity: "stage", id: args.stage_id.clone() })?;

        let position = state
            .deals
            .iter()
            .filter(|(owner, deal)| owner == &user.0 && deal.stage_id == args.stage_id)
            .map(|(_, deal)| deal.position)
            .max()
            .unwrap_or(0)
            + 1;

        let deal = DealRecord {
            id: Uuid::new_v4().to_string(),
            client_id: args.client_id,
            stage_id: args.stage_id,
            stage_name,
            title: args.title.trim().to_owned(),
            value: args.value.unwrap_or(Decimal::ZERO),
            position,
            expected_close_date: args.expected_close_date,
            notes: args.notes,
        };
        state.deals.push((user.0.clone(), deal.clone()));
        Ok(deal)
    }

    async fn update_deal(
        &self,
        user: &UserId,
        args: UpdateDealArgs,
    ) -> Result<DealRecord, StoreError> {
        args.validate().map_err(StoreError::Validation)?;
        let mut state = lock(&self.state);
        let deal = state
            .deals
            .iter_mut()
            .find(|(owner, deal)| owner == &user.0 && deal.id == args.deal_id)
            .map(|(_, deal)| deal)
            .ok_or_else(|| StoreError::NotFound { entity: "deal", id: args.deal_id.clone() })?;

        if let Some(title) = args.title {
            deal.title = title.trim().to_owned();
        }
        if let Some(value) = args.value {
            deal.value = value;
        }
        if let Some(expected_close_date) = args.expected_close_date {
            deal.expected_close_date = Some(expected_close_date);
        }
        if let Some(notes) = args.notes {
            deal.notes = Some(notes);
        }
        if let Some(client_id) = args.client_id {
            deal.client_id = Some(client_id);
        }
        Ok(deal.clone())
    }

    async fn move_deal_to_stage(
        &self,
        user: &UserId,
        deal_id: &str,
        stage_id: &str,
    ) -> Result<DealRecord, StoreError> {
        let mut state = lock(&self.state);
        let stage_name = state
            .stages
            .iter()
            .find(|(owner, id, _)| owner == &user.0 && id == stage_id)
            .map(|(_, _, name)| name.clone())
            .ok_or_else(|| StoreError::NotFound { entity: "stage", id: stage_id.to_owned() })?;

        let deal = state
            .deals
            .iter_mut()
            .find(|(owner, deal)| owner == &user.0 && deal.id == deal_id)
            .map(|(_, deal)| deal)
            .ok_or_else(|| StoreError::NotFound { entity: "deal", id: deal_id.to_owned() })?;

        deal.stage_id = stage_id.to_owned();
        deal.stage_name = stage_name;
        Ok(deal.clone())
    }

    async fn delete_deal(&self, user: &UserId, deal_id: &str) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let before = state.deals.len();
        state.deals.retain(|(owner, deal)| !(owner == &user.0 && deal.id == deal_id));
        if state.deals.len() == before {
            return Err(StoreError::NotFound { entity: "deal", id: deal_id.to_owned() });
        }
        Ok(())
    }
}
