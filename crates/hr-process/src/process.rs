//! Background process trait

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Context handed to a single run of a background process
#[derive(Debug, Clone)]
pub struct ProcessContext {
    id: String,
    run: u64,
    cancel: CancellationToken,
}

impl ProcessContext {
    /// Create a context for the `run`-th invocation of process `id`
    pub fn new(id: impl Into<String>, run: u64, cancel: CancellationToken) -> Self {
        Self {
            id: id.into(),
            run,
            cancel,
        }
    }

    /// Id of the running process
    pub fn id(&self) -> &str {
        &self.id
    }

    /// One-based number of this run
    pub fn run_number(&self) -> u64 {
        self.run
    }

    /// Whether the run was asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is asked to stop
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Sleep unless cancelled first; returns `false` on cancellation
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// A long-running or periodic unit of work
///
/// Implementations are built by the [`ProcessRegistry`](crate::ProcessRegistry)
/// and driven by a [`ProcessLifecycle`](crate::ProcessLifecycle). `run` should
/// observe [`ProcessContext::is_cancelled`] and return promptly once the
/// process is stopped.
#[async_trait]
pub trait BackgroundProcess: Send + Sync {
    /// Human-readable name used in logs
    fn name(&self) -> &str;

    /// Perform one run of the work
    async fn run(&self, ctx: ProcessContext) -> anyhow::Result<()>;

    /// Whether the process is currently able to work
    fn can_work(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Explanation shown when [`can_work`](Self::can_work) is false
    fn why_cannot_work(&self) -> Option<String> {
        None
    }

    /// Called before the process is (re)started
    async fn before_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the process is stopped
    async fn after_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
