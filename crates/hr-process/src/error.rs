//! Error types for process lifecycle management

use std::time::Duration;
use thiserror::Error;

use crate::status::InvalidTransition;
use crate::store::StorageError;

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Process lifecycle errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Rejected by the status table; the record is unchanged
    #[error(transparent)]
    IllegalTransition(#[from] InvalidTransition),

    /// The work failed or panicked; the record moved to `Failed`
    #[error("Process {id} failed: {message}")]
    Execution { id: String, message: String },

    /// The save callback failed after the in-memory status was updated
    #[error("Failed to persist process {id}: {message}")]
    Persistence { id: String, message: String },

    #[error("Period {period:?} of process {id} is shorter than the minimum {min:?}")]
    PeriodTooShort {
        id: String,
        period: Duration,
        min: Duration,
    },

    #[error("Unknown process kind: {0}")]
    UnknownKind(String),

    #[error("Invalid parameters for process kind {kind}: {message}")]
    InvalidParams { kind: String, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
