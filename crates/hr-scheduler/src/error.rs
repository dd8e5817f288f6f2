//! Error types for the scheduler

use hr_process::ProcessError;
use thiserror::Error;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Process already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Process not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}
