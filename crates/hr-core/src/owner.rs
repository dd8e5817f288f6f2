//! Owner identity

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one running automation-graph instance
///
/// An owner scopes a set of locks, condition listeners and exactly one poller
/// task. It is passed explicitly through every lock-manager call so that
/// correctness never depends on which worker executes a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create a new owner id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the owner id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&OwnerId> for OwnerId {
    fn from(id: &OwnerId) -> Self {
        id.clone()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
