use crate::models::EntityKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("CONFLICT: {entity} {key} expected revision {expected_revision}, backend has {actual_revision}")]
    Conflict {
        entity: EntityKind,
        key: String,
        expected_revision: u64,
        actual_revision: u64,
    },
    #[error("BACKEND_FAILURE: {0}")]
    Backend(String),
    #[error("TRANSPORT_FAILURE: {0}")]
    Transport(String),
    #[error("INVALID_RESPONSE: {0}")]
    InvalidResponse(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("QUEUE_CLOSED: {0}")]
    QueueClosed(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "CONFLICT",
            Self::Backend(_) => "BACKEND_FAILURE",
            Self::Transport(_) => "TRANSPORT_FAILURE",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Config(_) => "CONFIG_INVALID",
            Self::Io(_) => "IO_FAILURE",
            Self::QueueClosed(_) => "QUEUE_CLOSED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<std::io::Error> for SyncError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidResponse(value.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", value))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
