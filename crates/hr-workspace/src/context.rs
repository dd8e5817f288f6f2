//! Execution context of a running chain

use std::collections::HashMap;
use std::time::Duration;

use hr_core::{OwnerId, Value};
use hr_locks::{Lock, LockResult, SharedLockManager};
use tokio_util::sync::CancellationToken;

/// Variable holding the current loop iteration, starting at 0
pub const INDEX_VAR: &str = "index";

/// Variable holding the value that woke a hat block
pub const VALUE_VAR: &str = "value";

/// State visible to the blocks of one chain invocation
///
/// Every root chain and every hat invocation works on its own copy, so
/// variables set in one invocation never leak into another.
#[derive(Debug, Clone)]
pub struct BlockContext {
    owner: OwnerId,
    locks: SharedLockManager,
    cancel: CancellationToken,
    variables: HashMap<String, Value>,
}

impl BlockContext {
    pub fn new(owner: OwnerId, locks: SharedLockManager, cancel: CancellationToken) -> Self {
        Self {
            owner,
            locks,
            cancel,
            variables: HashMap::new(),
        }
    }

    /// Owner of every lock and listener this chain registers
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn lock_manager(&self) -> &SharedLockManager {
        &self.locks
    }

    /// Set a variable
    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Get a variable
    pub fn get_var(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Current loop iteration, if inside a loop block
    pub fn index(&self) -> Option<u64> {
        self.get_var(INDEX_VAR).and_then(Value::as_u64)
    }

    /// Value that woke the enclosing hat block
    pub fn value(&self) -> Option<&Value> {
        self.get_var(VALUE_VAR)
    }

    /// Fire a broadcast event from a command handler
    pub fn fire_event(&self, key: &str, value: Option<Value>) -> LockResult<bool> {
        self.locks.fire_event(key, value)
    }

    /// Whether the graph has been released
    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Release the whole graph
    pub fn release(&self) {
        self.cancel.cancel();
        self.locks.release(&self.owner);
    }

    /// Wait for `lock` to be signalled; returns false if the graph was released first
    ///
    /// The graph's own token is watched as well as the lock's, so a lock that
    /// outlives the graph cannot hold a chain forever.
    pub async fn wait_on(&self, lock: &Lock) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            woke = lock.wait() => woke && !self.cancel.is_cancelled(),
        }
    }

    /// Sleep for `duration`; returns false if the graph was released first
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => !self.cancel.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hr_locks::LockManager;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn context() -> BlockContext {
        BlockContext::new(
            OwnerId::from("graph"),
            Arc::new(LockManager::new()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_variables() {
        let mut ctx = context();
        assert!(ctx.index().is_none());

        ctx.set_var(INDEX_VAR, json!(3));
        ctx.set_var("name", json!("porch"));

        assert_eq!(ctx.index(), Some(3));
        assert_eq!(ctx.get_var("name"), Some(&json!("porch")));
        assert!(ctx.value().is_none());
    }

    #[test]
    fn test_clone_isolates_variables() {
        let mut ctx = context();
        ctx.set_var("a", json!(1));

        let mut copy = ctx.clone();
        copy.set_var("a", json!(2));

        assert_eq!(ctx.get_var("a"), Some(&json!(1)));
        assert_eq!(copy.get_var("a"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_pause_returns_false_after_release() {
        let ctx = context();
        assert!(ctx.pause(Duration::from_millis(5)).await);

        ctx.release();
        assert!(ctx.is_released());
        assert!(!ctx.pause(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_wait_on_ends_with_graph_on_orphan_lock() {
        let ctx = context();
        // A lock the manager never cancels
        let orphan = Lock::new("late", CancellationToken::new());

        let release = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.release();
            })
        };

        let woke = tokio::time::timeout(Duration::from_secs(2), ctx.wait_on(&orphan))
            .await
            .expect("release should end the wait");
        assert!(!woke);
        assert_eq!(orphan.waiter_count(), 0);
        release.await.unwrap();
    }

    #[test]
    fn test_wait_on_reports_signal() {
        let ctx = context();
        let lock = Lock::new("door", CancellationToken::new());
        let mut wait = task::spawn(ctx.wait_on(&lock));

        assert_pending!(wait.poll());
        lock.signal_all(Some(json!("open")));
        assert_ready_eq!(wait.poll(), true);
        assert_eq!(lock.last_value(), Some(json!("open")));
    }
}
