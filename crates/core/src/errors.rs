//! Error types for the notesync core crate.

use thiserror::Error;

use crate::sync::SyncErrorCode;

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the sync orchestration engine.
///
/// Only `Validation`, `Conflict`, and `NotFound` are surfaced synchronously to
/// direct callers of start/update/resume operations. Everything else is
/// absorbed into counters and error logs and reported through callbacks.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration or options; rejected before any state changes.
    #[error("validation error: {0}")]
    Validation(String),

    /// An equivalent operation is already active.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A resume token or persisted operation state could not be found.
    #[error("not found: {0}")]
    NotFound(String),

    /// State save/load against the persistence collaborator failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The query collaborator failed to execute a search or fetch a page.
    #[error("query error: {0}")]
    Query(String),

    /// A single record failed to materialize into a note.
    #[error("materialize error: {0}")]
    Materialize(String),

    /// The scheduled job callback returned an error or panicked.
    #[error("job failed: {0}")]
    Job(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    pub fn materialize(message: impl Into<String>) -> Self {
        Self::Materialize(message.into())
    }

    pub fn job(message: impl Into<String>) -> Self {
        Self::Job(message.into())
    }

    /// Category tag used when this error is recorded in a bounded error log
    /// or reported through the per-item error callback.
    pub fn category(&self) -> SyncErrorCode {
        match self {
            Self::Validation(_) => SyncErrorCode::Validation,
            Self::Conflict(_) => SyncErrorCode::Conflict,
            Self::NotFound(_) => SyncErrorCode::NotFound,
            Self::Persistence(_) => SyncErrorCode::Persistence,
            Self::Query(_) => SyncErrorCode::Network,
            Self::Materialize(_) => SyncErrorCode::Processing,
            Self::Job(_) => SyncErrorCode::Unknown,
        }
    }

    /// True for the error classes that surface synchronously to callers.
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Conflict(_) | Self::NotFound(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
