//! Context type for tracking the origin of broadcast events

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Context for tracking the origin and causality of fired events
///
/// Every event published by the lock manager carries a Context so a chain of
/// broadcasts triggered by one another can be correlated in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this context (ULID)
    pub id: String,

    /// Parent context ID for tracking causality chains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// Create a new context with a fresh ULID
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: None,
        }
    }

    /// Create a new context with a specific ID
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
        }
    }

    /// Create a child context with this context as parent
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: Some(self.id.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
