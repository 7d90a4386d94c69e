//! Error type shared by the document host, the orchestration engine and the
//! concrete tasks.

use thiserror::Error;

/// Operational classification of an [`AdmiralError`].
///
/// - `Validation`: malformed input, surfaced synchronously to the caller.
/// - `Transient`: an external collaborator failed or is not ready yet.
/// - `Invariant`: the task tried something the state machine forbids.
/// - `Infrastructure`: the store or the routing layer itself misbehaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    Invariant,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum AdmiralError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document already exists: {0}")]
    Conflict(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("remote operation failed: {0}")]
    Remote(String),

    #[error("task {0} is no longer accepting commands")]
    TaskUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AdmiralError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Serialization(_) => ErrorKind::Validation,
            Self::NotFound(_) | Self::Conflict(_) | Self::Remote(_) => ErrorKind::Transient,
            Self::InvalidTransition(_) | Self::PreconditionViolation(_) => ErrorKind::Invariant,
            Self::TaskUnavailable(_) | Self::Config(_) | Self::Toml(_) => {
                ErrorKind::Infrastructure
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AdmiralError>;
