//! Process factory registry
//!
//! Maps a `kind` tag to a constructor. Process implementations are resolved
//! once, when a process is registered with the scheduler.

use std::sync::Arc;

use dashmap::DashMap;
use hr_core::Value;
use tracing::debug;

use crate::error::{ProcessError, ProcessResult};
use crate::process::BackgroundProcess;

/// Constructor of a process implementation from its configured parameters
pub type ProcessFactory =
    Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn BackgroundProcess>> + Send + Sync + 'static>;

/// Registry of process factories by kind
#[derive(Default)]
pub struct ProcessRegistry {
    factories: DashMap<String, ProcessFactory>,
}

impl ProcessRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `kind`, replacing any previous one
    pub fn register<F>(&self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn BackgroundProcess>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        debug!(kind = %kind, "Registering process kind");
        self.factories.insert(kind, Arc::new(factory));
    }

    /// Whether a factory is registered for `kind`
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.iter().map(|r| r.key().clone()).collect();
        kinds.sort();
        kinds
    }

    /// Build a process of the given kind
    pub fn create(&self, kind: &str, params: &Value) -> ProcessResult<Arc<dyn BackgroundProcess>> {
        let factory = self
            .factories
            .get(kind)
            .map(|r| r.value().clone())
            .ok_or_else(|| ProcessError::UnknownKind(kind.to_string()))?;

        factory(params).map_err(|e| ProcessError::InvalidParams {
            kind: kind.to_string(),
            message: format!("{:#}", e),
        })
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
