//! Core types for the automation runtime
//!
//! This crate provides the small set of primitives shared by every other
//! crate in the workspace: the owner identity that scopes locks and pollers,
//! the broadcast event record, and the causality context attached to it.

mod context;
mod event;
mod owner;

pub use context::Context;
pub use event::Event;
pub use owner::OwnerId;

/// Payload carried by signals and broadcast events
pub type Value = serde_json::Value;

/// Well-known broadcast keys emitted by the runtime itself
pub mod keys {
    /// Fired by the server once every configured process is registered
    pub const RUNTIME_STARTED: &str = "runtime_started";

    /// Fired by the server right before shutdown begins
    pub const RUNTIME_STOPPING: &str = "runtime_stopping";
}
