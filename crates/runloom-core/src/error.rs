//! Error taxonomy.
//!
//! Configuration-time problems (bad schedules, malformed filters) and
//! collaborator failures are errors. Transition rejections are ordinary
//! values returned by the state machine; [`RunloomError::Rejected`] exists
//! only so callers who prefer `?` can lift one into an error.

use crate::transition::TransitionRejected;

/// Runloom error type.
#[derive(Debug, thiserror::Error)]
pub enum RunloomError {
    #[error("Invalid schedule: {0}")]
    InvalidScheduleSpec(String),

    #[error("Malformed work queue filter: {0}")]
    MalformedFilter(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid bucket width: {0}")]
    InvalidBucketWidth(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transition rejected: {0}")]
    Rejected(#[from] TransitionRejected),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunloomError {
    /// Whether the caller can retry (possibly after re-reading) rather than
    /// fix its configuration.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Rejected(_) | Self::Store(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RunloomError>;
