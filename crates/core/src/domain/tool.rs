use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditOperation;

/// The closed set of assistant tools.
///
/// Tool names arrive from the wire as strings; they are resolved to this
/// enum at the dispatch boundary and unknown names are rejected there,
/// never deeper in the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SearchClients,
    GetClientDetails,
    SearchPolicies,
    GetExpiringPolicies,
    GetFinancialSummary,
    GetAppointments,
    CreateClient,
    CreateAppointment,
    CreateDeal,
    UpdateDeal,
    MoveDealToStage,
    DeleteDeal,
}

pub const ALL_TOOLS: &[ToolName] = &[
    ToolName::SearchClients,
    ToolName::GetClientDetails,
    ToolName::SearchPolicies,
    ToolName::GetExpiringPolicies,
    ToolName::GetFinancialSummary,
    ToolName::GetAppointments,
    ToolName::CreateClient,
    ToolName::CreateAppointment,
    ToolName::CreateDeal,
    ToolName::UpdateDeal,
    ToolName::MoveDealToStage,
    ToolName::DeleteDeal,
];

impl ToolName {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "search_clients" => Some(Self::SearchClients),
            "get_client_details" => Some(Self::GetClientDetails),
            "search_policies" => Some(Self::SearchPolicies),
            "get_expiring_policies" => Some(Self::GetExpiringPolicies),
            "get_financial_summary" => Some(Self::GetFinancialSummary),
            "get_appointments" => Some(Self::GetAppointments),
            "create_client" => Some(Self::CreateClient),
            "create_appointment" => Some(Self::CreateAppointment),
            "create_deal" => Some(Self::CreateDeal),
            "update_deal" => Some(Self::UpdateDeal),
            "move_deal_to_stage" => Some(Self::MoveDealToStage),
            "delete_deal" => Some(Self::DeleteDeal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchClients => "search_clients",
            Self::GetClientDetails => "get_client_details",
            Self::SearchPolicies => "search_policies",
            Self::GetExpiringPolicies => "get_expiring_policies",
            Self::GetFinancialSummary => "get_financial_summary",
            Self::GetAppointments => "get_appointments",
            Self::CreateClient => "create_client",
            Self::CreateAppointment => "create_appointment",
            Self::CreateDeal => "create_deal",
            Self::UpdateDeal => "update_deal",
            Self::MoveDealToStage => "move_deal_to_stage",
            Self::DeleteDeal => "delete_deal",
        }
    }

    /// Static write/read classification. Only write tools are eligible
    /// for the cache invalidation cascade.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::CreateClient
                | Self::CreateAppointment
                | Self::CreateDeal
                | Self::UpdateDeal
                | Self::MoveDealToStage
                | Self::DeleteDeal
        )
    }

    pub fn operation(&self) -> AuditOperation {
        match self {
            Self::SearchClients
            | Self::GetClientDetails
            | Self::SearchPolicies
            | Self::GetExpiringPolicies
            | Self::GetFinancialSummary
            | Self::GetAppointments => AuditOperation::Read,
            Self::CreateClient | Self::CreateAppointment | Self::CreateDeal => {
                AuditOperation::Create
            }
            Self::UpdateDeal | Self::MoveDealToStage => AuditOperation::Update,
            Self::DeleteDeal => AuditOperation::Delete,
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::SearchClients | Self::GetClientDetails | Self::CreateClient => "client",
            Self::SearchPolicies | Self::GetExpiringPolicies => "policy",
            Self::GetFinancialSummary => "financial_entry",
            Self::GetAppointments | Self::CreateAppointment => "appointment",
            Self::CreateDeal | Self::UpdateDeal | Self::MoveDealToStage | Self::DeleteDeal => {
                "deal"
            }
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tool invocation request as it appears on the wire: raw name plus
/// structured arguments. The name stays a string until the dispatcher
/// resolves it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self { name: name.into(), arguments }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOutcome {
    Succeeded,
    Failed,
}

impl ToolOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ToolName, ALL_TOOLS};

    #[test]
    fn every_tool_round_trips_through_parse() {
        for tool in ALL_TOOLS {
            assert_eq!(ToolName::parse(tool.as_str()), Some(*tool));
        }
    }

    #[test]
    fn unknown_names_are_rejected_at_the_boundary() {
        assert_eq!(ToolName::parse("drop_all_tables"), None);
        assert_eq!(ToolName::parse(""), None);
        assert_eq!(ToolName::parse("Create_Deal"), None);
    }

    #[test]
    fn write_classification_covers_exactly_the_mutating_tools() {
        let writes: Vec<_> = ALL_TOOLS.iter().filter(|tool| tool.is_write()).collect();
        assert_eq!(writes.len(), 6);
        assert!(ToolName::MoveDealToStage.is_write());
        assert!(!ToolName::GetFinancialSummary.is_write());
    }
}
