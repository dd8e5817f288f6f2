//! Condition locks and broadcast signalling
//!
//! This crate provides the suspension primitive of the runtime. A [`Lock`]
//! is a named condition variable: hat blocks suspend on it and are resumed
//! when an event producer signals the lock's key, or when the owner's poller
//! observes that a registered condition has become true.
//!
//! # Key Types
//!
//! - [`Lock`] - A named condition variable with an optional last payload
//! - [`LockManager`] - Per-owner lock registries, pollers and global broadcast
//! - [`LockManagerConfig`] - Poll interval and event stream capacity

mod error;
mod lock;
mod manager;

pub use error::{LockError, LockResult};
pub use lock::Lock;
pub use manager::{ConditionFn, LockManager, LockManagerConfig, SharedLockManager};
