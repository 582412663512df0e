use serde::{Deserialize, Serialize};

use crate::domain::tool::ToolName;

/// A named, independently invalidatable unit of cached read data
/// consumed by the UI layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePartition {
    Clients,
    ClientDetails,
    Policies,
    ExpiringPolicies,
    CrmDeals,
    Appointments,
    FinancialSummary,
    DashboardMetrics,
    RecentActivity,
}

impl CachePartition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clients => "clients",
            Self::ClientDetails => "client_details",
            Self::Policies => "policies",
            Self::ExpiringPolicies => "expiring_policies",
            Self::CrmDeals => "crm_deals",
            Self::Appointments => "appointments",
            Self::FinancialSummary => "financial_summary",
            Self::DashboardMetrics => "dashboard_metrics",
            Self::RecentActivity => "recent_activity",
        }
    }
}

impl std::fmt::Display for CachePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Partitions refreshed after every completed write tool, regardless of
/// which tool fired. These aggregate several entity types, so precise
/// per-tool mapping is not attempted for them; over-invalidation is the
/// accepted safety margin.
pub const CRITICAL_PARTITIONS: &[CachePartition] =
    &[CachePartition::DashboardMetrics, CachePartition::RecentActivity];

/// Static mapping from write tools to the cache partitions their side
/// effects dirty. Configuration data, not per-conversation state.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheDependencyGraph;

impl CacheDependencyGraph {
    pub fn partitions_for(&self, tool: ToolName) -> &'static [CachePartition] {
        match tool {
            ToolName::CreateClient => &[CachePartition::Clients, CachePartition::ClientDetails],
            ToolName::CreateAppointment => &[CachePartition::Appointments],
            ToolName::CreateDeal
            | ToolName::UpdateDeal
            | ToolName::MoveDealToStage
            | ToolName::DeleteDeal => &[CachePartition::CrmDeals],
            // Read tools never invalidate anything.
            ToolName::SearchClients
            | ToolName::GetClientDetails
            | ToolName::SearchPolicies
            | ToolName::GetExpiringPolicies
            | ToolName::GetFinancialSummary
            | ToolName::GetAppointments => &[],
        }
    }

    /// The full cascade target set for a completed write tool: mapped
    /// partitions plus the critical partitions, deduplicated, in a
    /// stable order.
    pub fn cascade_targets(&self, tool: ToolName) -> Vec<CachePartition> {
        let mut targets = Vec::new();
        for partition in self.partitions_for(tool).iter().chain(CRITICAL_PARTITIONS) {
            if !targets.contains(partition) {
                targets.push(*partition);
            }
        }
        targets
    }
}
