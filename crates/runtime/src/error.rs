use thiserror::Error;

use volition_core::CommitError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("Unknown template '{name}' of kind {kind}")]
    UnknownTemplate { kind: &'static str, name: String },

    #[error("Agent '{0}' not found")]
    AgentNotFound(String),

    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    #[error("Agent '{0}' already exists")]
    AgentAlreadyExists(String),

    #[error("Engine thread already started")]
    AlreadyStarted,

    #[error("No action handle matches the completion")]
    UnknownActionHandle,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
