//! Broadcast event record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, Value};

/// A broadcast event as observed by global event subscribers
///
/// Produced for every `fire_event` call that was not collapsed by
/// last-value de-duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Broadcast key; hat nodes holding a lock with this key are woken
    pub key: String,

    /// Optional payload, also stored as the lock's last value
    #[serde(default)]
    pub value: Option<Value>,

    /// When the event was fired
    pub time_fired: DateTime<Utc>,

    /// Context tracking the origin and causality
    pub context: Context,
}

impl Event {
    /// Create a new event with current timestamp
    pub fn new(key: impl Into<String>, value: Option<Value>, context: Context) -> Self {
        Self {
            key: key.into(),
            value,
            time_fired: Utc::now(),
            context,
        }
    }
}
