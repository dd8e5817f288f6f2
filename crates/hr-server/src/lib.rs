//! Automation runtime server
//!
//! Wires the lock manager, scheduler, process registry and record store
//! from a [`RuntimeConfig`](hr_config::RuntimeConfig).

pub mod processes;
pub mod runtime;

pub use processes::{builtin_registry, BroadcastProcess, BROADCAST_KIND};
pub use runtime::Runtime;
