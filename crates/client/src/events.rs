use brokerdesk_core::domain::tool::ToolOutcome;

/// Discriminated events delivered to the UI layer over a typed
/// channel. The consumer never calls back into the UI directly.
#[derive(Clone, Debug, PartialEq)]
pub enum AssistantEvent {
    /// The live assistant message text. Monotonic: each update carries
    /// the full accumulated content, which only ever grows until the
    /// turn finalizes.
    ContentUpdated { content: String },
    /// A tool started executing. `synthetic` marks the soft-fallback
    /// "analyzing" placeholder, which is not a real upstream tool.
    ToolStarted { name: String, synthetic: bool },
    ToolCompleted { name: String, outcome: ToolOutcome },
    /// Terminal event; emitted exactly once per turn.
    Finalized(FinalizedMessage),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Termination {
    /// The stream reached its completion sentinel.
    Completed,
    /// The hard timeout elapsed; accumulated content was replaced by a
    /// fixed notice.
    HardTimeout,
    /// The user cancelled mid-stream; partial content is preserved.
    Cancelled,
    /// The upstream reported or implied a terminal error; partial
    /// content is preserved.
    UpstreamError(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FinalizedMessage {
    pub content: String,
    pub termination: Termination,
}

impl FinalizedMessage {
    pub fn is_error(&self) -> bool {
        matches!(self.termination, Termination::HardTimeout | Termination::UpstreamError(_))
    }
}
