use serde_json::Value;
use thiserror::Error;

/// Errors surfaced on the calling path. All of them are values; nothing in
/// the runtime panics the host application.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    #[error("unknown entity type: {0}")]
    UnknownType(String),

    #[error("handler failed: {0}")]
    Handler(Value),

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("load failed: {0}")]
    LoadFailed(String),

    #[error("schedule failed: {0}")]
    ScheduleFailed(String),

    #[error("activation failed: {0}")]
    ActivationFailed(String),

    #[error("invalid entity definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("deadline elapsed")]
    Timeout,

    #[error("instance mailbox closed")]
    MailboxClosed,

    #[error("runtime is shutting down")]
    Shutdown,
}

impl From<scheduler::ScheduleError> for RuntimeError {
    fn from(e: scheduler::ScheduleError) -> Self {
        RuntimeError::ScheduleFailed(e.to_string())
    }
}

impl RuntimeError {
    /// Stable kind tag used when an error crosses the wire to another node.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::UnknownHandler(_) => "unknown_handler",
            RuntimeError::UnknownType(_) => "unknown_type",
            RuntimeError::Handler(_) => "handler",
            RuntimeError::PersistenceFailed(_) => "persistence_failed",
            RuntimeError::LoadFailed(_) => "load_failed",
            RuntimeError::ScheduleFailed(_) => "schedule_failed",
            RuntimeError::ActivationFailed(_) => "activation_failed",
            RuntimeError::InvalidDefinition(_) => "invalid_definition",
            RuntimeError::Config(_) => "config",
            RuntimeError::Timeout => "timeout",
            RuntimeError::MailboxClosed => "mailbox_closed",
            RuntimeError::Shutdown => "shutdown",
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
