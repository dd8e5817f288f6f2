//! Built-in process kinds

use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use hr_core::Value;
use hr_locks::SharedLockManager;
use hr_process::{BackgroundProcess, ProcessContext, ProcessRegistry};
use serde::Deserialize;
use tracing::debug;

/// Tag of [`BroadcastProcess`] in the registry
pub const BROADCAST_KIND: &str = "broadcast";

#[derive(Debug, Deserialize)]
struct BroadcastParams {
    key: String,
    #[serde(default)]
    value: Option<Value>,
}

/// Fires a broadcast event on every run
///
/// Without a configured `value` the payload is the run number, so every run
/// is delivered. A configured value is de-duplicated like any other event
/// and only reaches listeners when it changes.
pub struct BroadcastProcess {
    key: String,
    value: Option<Value>,
    locks: SharedLockManager,
}

impl BroadcastProcess {
    pub fn from_params(params: &Value, locks: SharedLockManager) -> anyhow::Result<Self> {
        let params = BroadcastParams::deserialize(params).context("invalid broadcast params")?;
        if params.key.is_empty() {
            return Err(anyhow!("broadcast key must not be empty"));
        }
        Ok(Self {
            key: params.key,
            value: params.value,
            locks,
        })
    }
}

#[async_trait]
impl BackgroundProcess for BroadcastProcess {
    fn name(&self) -> &str {
        BROADCAST_KIND
    }

    async fn run(&self, ctx: ProcessContext) -> anyhow::Result<()> {
        let value = self
            .value
            .clone()
            .unwrap_or_else(|| Value::from(ctx.run_number()));
        let fired = self.locks.fire_event(&self.key, Some(value))?;
        debug!(process_id = %ctx.id(), key = %self.key, fired, "Broadcast process fired");
        Ok(())
    }
}

/// Registry with every built-in kind
pub fn builtin_registry(locks: SharedLockManager) -> ProcessRegistry {
    let registry = ProcessRegistry::new();
    registry.register(BROADCAST_KIND, move |params| {
        Ok(Arc::new(BroadcastProcess::from_params(params, locks.clone())?)
            as Arc<dyn BackgroundProcess>)
    });
    registry
}
