//! CRM entities and tool-operation parameters.
//!
//! These are the shapes the assistant tools read and mutate. Argument
//! structs deserialize straight from tool-call payloads; validation
//! lives here so every store implementation enforces the same rules.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub cpf_cnpj: Option<String>,
    pub status: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientDetails {
    pub client: ClientRecord,
    pub policies: Vec<PolicyRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: String,
    pub client_id: String,
    pub client_name: Option<String>,
    pub policy_number: String,
    pub status: String,
    pub premium: Decimal,
    pub line_of_business: String,
    pub insurer: String,
    pub start_date: NaiveDate,
    pub expiration_date: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientSearchResult {
    pub total_count: i64,
    pub clients: Vec<ClientRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicySearchResult {
    pub total_count: i64,
    pub policies: Vec<PolicyRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinancialSummary {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub total_income: Decimal,
    pub total_expenses: Decimal,
    pub net_balance: Decimal,
    pub entry_count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRecord {
    pub id: String,
    pub client_id: Option<String>,
    pub title: String,
    pub date: NaiveDate,
    pub time: String,
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub id: String,
    pub client_id: Option<String>,
    pub stage_id: String,
    pub stage_name: String,
    pub title: String,
    pub value: Decimal,
    pub position: i64,
    pub expected_close_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

fn default_search_limit() -> u32 {
    10
}

pub const MAX_SEARCH_LIMIT: u32 = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchClientsArgs {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

impl Default for SearchClientsArgs {
    fn default() -> Self {
        Self { query: None, status: None, limit: default_search_limit() }
    }
}

impl SearchClientsArgs {
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_SEARCH_LIMIT)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchPoliciesArgs {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub line_of_business: Option<String>,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

impl Default for SearchPoliciesArgs {
    fn default() -> Self {
        Self { client_id: None, status: None, line_of_business: None, limit: default_search_limit() }
    }
}

impl SearchPoliciesArgs {
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_SEARCH_LIMIT)
    }
}

fn default_expiring_days() -> u32 {
    30
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpiringPoliciesArgs {
    #[serde(default = "default_expiring_days")]
    pub days: u32,
}

impl Default for ExpiringPoliciesArgs {
    fn default() -> Self {
        Self { days: default_expiring_days() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialSummaryArgs {
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetAppointmentsArgs {
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateClientArgs {
    pub name: String,
    pub phone: String,
    pub email: String,
    #[serde(default)]
    pub cpf_cnpj: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CreateClientArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().chars().count() < 2 {
            return Err("client name must have at least 2 characters".to_string());
        }
        if self.phone.trim().chars().count() < 10 {
            return Err("client phone must have at least 10 digits".to_string());
        }
        if !self.email.contains('@') {
            return Err("client email is invalid".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateAppointmentArgs {
    #[serde(default)]
    pub client_id: Option<String>,
    pub title: String,
    pub date: NaiveDate,
    pub time: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CreateAppointmentArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("appointment title must not be empty".to_string());
        }
        let valid_time = self.time.len() == 5
            && self.time.as_bytes()[2] == b':'
            && self.time[..2].parse::<u8>().is_ok_and(|hour| hour < 24)
            && self.time[3..].parse::<u8>().is_ok_and(|minute| minute < 60);
        if !valid_time {
            return Err(format!("appointment time `{}` is not HH:MM", self.time));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateDealArgs {
    #[serde(default)]
    pub client_id: Option<String>,
    pub stage_id: String,
    pub title: String,
    #[serde(default)]
    pub value: Option<Decimal>,
    #[serde(default)]
    pub expected_close_date: Option<NaiveDate>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CreateDealArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().chars().count() < 3 {
            return Err("deal title must have at least 3 characters".to_string());
        }
        if self.stage_id.trim().is_empty() {
            return Err("stage_id is required".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDealArgs {
    pub deal_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub value: Option<Decimal>,
    #[serde(default)]
    pub expected_close_date: Option<NaiveDate>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl UpdateDealArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.title.is_none()
            && self.value.is_none()
            && self.expected_close_date.is_none()
            && self.notes.is_none()
            && self.client_id.is_none()
        {
            return Err("no fields to update were provided".to_string());
        }
        if self.title.as_ref().is_some_and(|title| title.trim().chars().count() < 3) {
            return Err("deal title must have at least 3 characters".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveDealArgs {
    pub deal_id: String,
    pub stage_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteDealArgs {
    pub deal_id: String,
    #[serde(default)]
    pub confirmed: bool,
}
