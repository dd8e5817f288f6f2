//! Error types for lock management

use thiserror::Error;

/// Result type for lock manager operations
pub type LockResult<T> = Result<T, LockError>;

/// Errors raised by the lock manager
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Events must carry a non-empty key
    #[error("unable to fire event with empty key")]
    EmptyKey,

    /// Pollers are Tokio tasks and need a running runtime
    #[error("no Tokio runtime available to start the poller for owner '{owner}'")]
    NoRuntime { owner: String },
}
