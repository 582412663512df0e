pub mod audit;
pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod ratelimit;
pub mod wire;

pub use audit::{
    AuditOperation, AuditSink, AuditSinkError, InMemoryAuditSink, ToolInvocationRecord,
};
pub use cache::{CacheDependencyGraph, CachePartition, CRITICAL_PARTITIONS};
pub use domain::conversation::{
    ChatMessage, Conversation, ConversationId, MessageId, MessageRole, UserId,
};
pub use domain::crm::{
    AppointmentRecord, ClientDetails, ClientRecord, ClientSearchResult, CreateAppointmentArgs,
    CreateClientArgs, CreateDealArgs, DealRecord, DeleteDealArgs, ExpiringPoliciesArgs,
    FinancialSummary, FinancialSummaryArgs, GetAppointmentsArgs, MoveDealArgs, PolicyRecord,
    PolicySearchResult, SearchClientsArgs, SearchPoliciesArgs, UpdateDealArgs,
};
pub use domain::tool::{ToolInvocation, ToolName, ToolOutcome, ALL_TOOLS};
pub use errors::{DomainError, InterfaceError, TurnError};
pub use ratelimit::{
    Admission, AdmissionStore, AdmissionStoreError, InMemoryAdmissionStore, SlidingWindowLimiter,
};
pub use wire::{FrameBuffer, FrameParse, StreamPayload, WireEvent};
