//! Error types for block execution

use hr_locks::LockError;
use thiserror::Error;

/// Result type for block execution
pub type BlockResult<T> = Result<T, BlockError>;

/// Block execution errors
///
/// An error aborts the current invocation of one chain only.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Block {block} failed: {message}")]
    Handler { block: String, message: String },

    #[error("Block {block} is invalid: {reason}")]
    InvalidBlock { block: String, reason: String },

    #[error(transparent)]
    Lock(#[from] LockError),
}
