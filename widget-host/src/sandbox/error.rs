use thiserror::Error;

use crate::protocol::Thrown;

/// Why an attempt did not end up mounted
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    /// The code imports host rendering primitives directly
    #[error("Import rejected: {0}")]
    ImportRejected(String),

    /// The code reaches for interpreter internals the sandbox hides
    #[error("Access rejected: {0}")]
    ForbiddenAccess(String),

    #[error("Failed to load widget module: {0}")]
    Load(Thrown),

    #[error("{0}")]
    ExportContract(String),

    /// The probe render threw
    #[error("Widget failed during its first render: {0}")]
    SynchronousRender(Thrown),

    /// A mounted instance threw from a re-render, timer or listener
    #[error("Widget runtime error: {0}")]
    AsyncRuntime(Thrown),

    #[error("Widget channel closed: {0}")]
    ChannelClosed(String),

    /// The execution engine could not start
    #[error("Widget engine unavailable: {0}")]
    Engine(String),
}

impl SandboxError {
    /// The thrown value behind this error, as the classifier sees it
    pub fn thrown(&self) -> Thrown {
        match self {
            SandboxError::Load(t) | SandboxError::SynchronousRender(t) | SandboxError::AsyncRuntime(t) => {
                t.clone()
            }
            SandboxError::ImportRejected(message)
            | SandboxError::ForbiddenAccess(message)
            | SandboxError::ExportContract(message)
            | SandboxError::ChannelClosed(message)
            | SandboxError::Engine(message) => Thrown::new(message.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::ImportRejected(_) => "import_rejected",
            SandboxError::ForbiddenAccess(_) => "forbidden_access",
            SandboxError::Load(_) => "load",
            SandboxError::ExportContract(_) => "export_contract",
            SandboxError::SynchronousRender(_) => "synchronous_render",
            SandboxError::AsyncRuntime(_) => "async_runtime",
            SandboxError::ChannelClosed(_) => "channel_closed",
            SandboxError::Engine(_) => "engine",
        }
    }
}

/// Where the current attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPhase {
    Idle,
    Validating,
    Loading,
    Probing,
    AwaitingApproval,
    Mounted,
    Rejected,
    Failed,
}

impl SandboxPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxPhase::Idle => "idle",
            SandboxPhase::Validating => "validating",
            SandboxPhase::Loading => "loading",
            SandboxPhase::Probing => "probing",
            SandboxPhase::AwaitingApproval => "awaiting_approval",
            SandboxPhase::Mounted => "mounted",
            SandboxPhase::Rejected => "rejected",
            SandboxPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
