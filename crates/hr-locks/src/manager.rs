//! Lock manager
//!
//! The [`LockManager`] keeps one lock registry per owner, runs one poller task
//! per owner for polled conditions, and routes global broadcasts to every
//! owner holding a lock with the broadcast key.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hr_core::{Context, Event, OwnerId, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{LockError, LockResult};
use crate::lock::Lock;

/// Default interval between two evaluations of polled conditions
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default capacity of the fired-event stream
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A polled condition; must be cheap and non-blocking
pub type ConditionFn = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

/// Thread-safe wrapper for LockManager
pub type SharedLockManager = Arc<LockManager>;

/// Lock manager tuning
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Interval between two poller ticks
    pub poll_interval: Duration,
    /// Capacity of the fired-event broadcast channel
    pub event_capacity: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

struct Listener {
    lock: Arc<Lock>,
    condition: ConditionFn,
}

/// Locks, listeners and poller of one owner
struct OwnerContext {
    owner: OwnerId,
    locks: DashMap<String, Arc<Lock>>,
    listeners: DashMap<String, Arc<Listener>>,
    poller: OnceLock<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl OwnerContext {
    fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            locks: DashMap::new(),
            listeners: DashMap::new(),
            poller: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self, key: &str) -> Arc<Lock> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(owner = %self.owner, key, "Creating lock");
                Arc::new(Lock::new(key, self.cancel.clone()))
            })
            .value()
            .clone()
    }

    /// Evaluate every listener once; returns the number of locks signalled
    fn poll_once(&self) -> usize {
        let listeners: Vec<(String, Arc<Listener>)> = self
            .listeners
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut signalled = 0;
        for (watch_id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| (listener.condition)())) {
                Ok(true) => {
                    listener.lock.signal_all(None);
                    signalled += 1;
                }
                Ok(false) => {}
                Err(panic) => {
                    warn!(
                        owner = %self.owner,
                        watch_id = %watch_id,
                        error = %panic_message(panic.as_ref()),
                        "Condition check failed"
                    );
                }
            }
        }
        signalled
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(poller) = self.poller.get() {
            poller.abort();
        }
        self.listeners.clear();
        self.locks.clear();
    }
}

/// Manager of per-owner locks and condition pollers
///
/// The manager supports:
/// - Lazily created locks, exactly one per (owner, key)
/// - Polled conditions, evaluated by one poller task per owner
/// - Global broadcast of a key to every owner
/// - De-duplicated events published on a broadcast stream
pub struct LockManager {
    owners: DashMap<OwnerId, Arc<OwnerContext>>,
    last_values: DashMap<String, Value>,
    sender: broadcast::Sender<Event>,
    poll_interval: Duration,
}

impl LockManager {
    /// Create a lock manager with default settings
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    /// Create a lock manager with the given settings
    pub fn with_config(config: LockManagerConfig) -> Self {
        let (sender, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            owners: DashMap::new(),
            last_values: DashMap::new(),
            sender,
            poll_interval: config.poll_interval,
        }
    }

    /// Interval between two poller ticks
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn owner_context(&self, owner: &OwnerId) -> Arc<OwnerContext> {
        self.owners
            .entry(owner.clone())
            .or_insert_with(|| {
                debug!(owner = %owner, "Registering lock owner");
                Arc::new(OwnerContext::new(owner.clone()))
            })
            .value()
            .clone()
    }

    /// Get the lock registered under `key` for `owner`, creating it if needed
    pub fn get_or_create_lock(&self, owner: impl Into<OwnerId>, key: &str) -> Arc<Lock> {
        let owner = owner.into();
        self.owner_context(&owner).lock(key)
    }

    /// Register a polled condition and return the lock it signals
    ///
    /// The owner's poller evaluates `condition` on every tick and signals the
    /// returned lock whenever it holds. Registering the same `watch_id` again
    /// replaces the previous condition.
    pub fn listen_event<F>(
        &self,
        owner: impl Into<OwnerId>,
        watch_id: &str,
        condition: F,
    ) -> LockResult<Arc<Lock>>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let owner = owner.into();
        let ctx = self.owner_context(&owner);
        let lock = ctx.lock(watch_id);

        ctx.listeners.insert(
            watch_id.to_string(),
            Arc::new(Listener {
                lock: lock.clone(),
                condition: Arc::new(condition),
            }),
        );
        debug!(owner = %owner, watch_id, "Listening for condition");

        self.ensure_poller(&ctx)?;
        Ok(lock)
    }

    /// Remove a polled condition; the poller keeps running for the owner
    pub fn remove_listener(&self, owner: &OwnerId, watch_id: &str) -> bool {
        self.owners
            .get(owner)
            .map(|ctx| ctx.listeners.remove(watch_id).is_some())
            .unwrap_or(false)
    }

    fn ensure_poller(&self, ctx: &Arc<OwnerContext>) -> LockResult<()> {
        if ctx.poller.get().is_some() {
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| LockError::NoRuntime {
            owner: ctx.owner.to_string(),
        })?;

        ctx.poller.get_or_init(|| {
            debug!(owner = %ctx.owner, interval = ?self.poll_interval, "Starting poller");
            handle.spawn(run_poller(
                ctx.owner.clone(),
                Arc::downgrade(ctx),
                ctx.cancel.clone(),
                self.poll_interval,
            ))
        });
        Ok(())
    }

    /// Signal `key` on every owner holding a lock with that key
    ///
    /// Returns the number of owners that were signalled.
    pub fn signal_all(&self, key: &str, value: Option<Value>) -> usize {
        let mut signalled = 0;
        for ctx in self.owners.iter() {
            if let Some(lock) = ctx.locks.get(key) {
                lock.signal_all(value.clone());
                signalled += 1;
            }
        }
        trace!(key, owners = signalled, "Broadcast signal");
        signalled
    }

    /// Fire a broadcast event, collapsing repeats of the same value
    ///
    /// A non-null `value` equal to the last value fired for `key` is ignored
    /// and `Ok(false)` is returned. Null values always fire. Remembered values
    /// are dropped when the last owner holding a lock for their key is
    /// released.
    pub fn fire_event(&self, key: &str, value: Option<Value>) -> LockResult<bool> {
        if key.is_empty() {
            return Err(LockError::EmptyKey);
        }

        if let Some(value) = &value {
            match self.last_values.entry(key.to_string()) {
                Entry::Occupied(mut last) => {
                    if last.get() == value {
                        trace!(key, "Skipping duplicate event");
                        return Ok(false);
                    }
                    last.insert(value.clone());
                }
                Entry::Vacant(slot) => {
                    slot.insert(value.clone());
                }
            }
        }

        debug!(key, "Firing event");
        self.signal_all(key, value.clone());

        // Ignore send errors - they just mean no active subscribers
        let _ = self.sender.send(Event::new(key, value, Context::new()));
        Ok(true)
    }

    /// Subscribe to every event that passes de-duplication
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Tear down an owner: cancel its poller and every waiter on its locks
    ///
    /// Idempotent; releasing an unknown owner is a no-op. Returns whether the
    /// owner was registered.
    pub fn release(&self, owner: &OwnerId) -> bool {
        match self.owners.remove(owner) {
            Some((_, ctx)) => {
                info!(
                    owner = %owner,
                    locks = ctx.locks.len(),
                    listeners = ctx.listeners.len(),
                    "Releasing lock owner"
                );
                ctx.shutdown();
                self.evict_unheld_values();
                true
            }
            None => {
                trace!(owner = %owner, "Release of unknown owner ignored");
                false
            }
        }
    }

    /// Forget last values whose key no remaining owner holds a lock for
    fn evict_unheld_values(&self) {
        let mut held = HashSet::new();
        for ctx in self.owners.iter() {
            for lock in ctx.locks.iter() {
                held.insert(lock.key().clone());
            }
        }

        let before = self.last_values.len();
        self.last_values.retain(|key, _| held.contains(key));
        let evicted = before.saturating_sub(self.last_values.len());
        if evicted > 0 {
            debug!(evicted, "Dropped last values of released keys");
        }
    }

    /// Whether `owner` currently has a context
    pub fn has_owner(&self, owner: &OwnerId) -> bool {
        self.owners.contains_key(owner)
    }

    /// Number of registered owners
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    /// Whether a poller task is currently running for `owner`
    pub fn is_polling(&self, owner: &OwnerId) -> bool {
        self.owners
            .get(owner)
            .and_then(|ctx| ctx.poller.get().map(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("owners", &self.owners.len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        for ctx in self.owners.iter() {
            ctx.shutdown();
        }
    }
}

async fn run_poller(
    owner: OwnerId,
    ctx: Weak<OwnerContext>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(ctx) = ctx.upgrade() else {
            break;
        };
        let signalled = ctx.poll_once();
        if signalled > 0 {
            trace!(owner = %owner, signalled, "Poller tick");
        }
    }

    debug!(owner = %owner, "Poller stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    fn fast_manager() -> LockManager {
        LockManager::with_config(LockManagerConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        })
    }

    async fn wait_for_waiters(lock: &Lock, expected: usize) {
        for _ in 0..400 {
            if lock.waiter_count() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} waiters on '{}'", expected, lock.key());
    }

    #[test]
    fn test_one_lock_per_owner_and_key() {
        let manager = LockManager::new();
        let a = manager.get_or_create_lock("g1", "k");
        let b = manager.get_or_create_lock("g1", "k");
        let other_owner = manager.get_or_create_lock("g2", "k");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other_owner));
        assert_eq!(manager.owner_count(), 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let manager = LockManager::new();
        assert!(!manager.release(&OwnerId::new("never-registered")));

        manager.get_or_create_lock("g1", "k");
        assert!(manager.release(&OwnerId::new("g1")));
        assert!(!manager.release(&OwnerId::new("g1")));
        assert!(!manager.has_owner(&OwnerId::new("g1")));
    }

    #[test]
    fn test_release_cancels_locks_and_new_lock_is_fresh() {
        let manager = LockManager::new();
        let old = manager.get_or_create_lock("g1", "k");
        manager.release(&OwnerId::new("g1"));
        assert!(old.is_cancelled());

        let fresh = manager.get_or_create_lock("g1", "k");
        assert!(!fresh.is_cancelled());
        assert!(!Arc::ptr_eq(&old, &fresh));
    }

    #[test]
    fn test_listen_event_without_runtime() {
        let manager = LockManager::new();
        let result = manager.listen_event("g1", "w1", || true);
        assert!(matches!(result, Err(LockError::NoRuntime { .. })));
    }

    #[test]
    fn test_fire_event_rejects_empty_key() {
        let manager = LockManager::new();
        assert_eq!(manager.fire_event("", None), Err(LockError::EmptyKey));
    }

    #[test]
    fn test_fire_event_deduplicates_equal_values() {
        let manager = LockManager::new();
        let mut rx = manager.subscribe();

        assert_eq!(manager.fire_event("temp", Some(json!(21))), Ok(true));
        assert_eq!(manager.fire_event("temp", Some(json!(21))), Ok(false));
        assert_eq!(manager.fire_event("temp", Some(json!(22))), Ok(true));

        assert_eq!(rx.try_recv().unwrap().value, Some(json!(21)));
        assert_eq!(rx.try_recv().unwrap().value, Some(json!(22)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_release_forgets_values_of_unheld_keys() {
        let manager = LockManager::new();
        manager.get_or_create_lock("g1", "temp");
        manager.get_or_create_lock("g1", "door");
        manager.get_or_create_lock("g2", "door");

        assert_eq!(manager.fire_event("temp", Some(json!(21))), Ok(true));
        assert_eq!(manager.fire_event("door", Some(json!("open"))), Ok(true));
        manager.release(&OwnerId::new("g1"));

        // Nobody holds "temp" any more; "door" is still held by g2
        assert_eq!(manager.fire_event("temp", Some(json!(21))), Ok(true));
        assert_eq!(manager.fire_event("door", Some(json!("open"))), Ok(false));
    }

    #[test]
    fn test_fire_event_null_value_always_fires() {
        let manager = LockManager::new();
        assert_eq!(manager.fire_event("tick", None), Ok(true));
        assert_eq!(manager.fire_event("tick", None), Ok(true));
    }

    #[test]
    fn test_signal_all_reaches_every_owner_with_key() {
        let manager = LockManager::new();
        let a = manager.get_or_create_lock("g1", "alarm");
        let b = manager.get_or_create_lock("g2", "alarm");
        manager.get_or_create_lock("g3", "other");

        assert_eq!(manager.signal_all("alarm", Some(json!("on"))), 2);
        assert_eq!(a.last_value(), Some(json!("on")));
        assert_eq!(b.last_value(), Some(json!("on")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_polled_condition_wakes_waiter() {
        let manager = fast_manager();
        let flag = Arc::new(AtomicBool::new(false));

        let lock = {
            let flag = flag.clone();
            manager
                .listen_event("g1", "w1", move || flag.load(Ordering::SeqCst))
                .unwrap()
        };
        assert!(manager.is_polling(&OwnerId::new("g1")));

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.wait().await })
        };
        wait_for_waiters(&lock, 1).await;

        let flipped_at = Instant::now();
        flag.store(true, Ordering::SeqCst);

        let woke = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("poller should signal the lock")
            .unwrap();
        assert!(woke);
        assert!(flipped_at.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_condition_does_not_stop_poller() {
        let manager = fast_manager();
        let healthy_checks = Arc::new(AtomicUsize::new(0));

        manager
            .listen_event("g1", "bad", || panic!("sensor unplugged"))
            .unwrap();
        {
            let healthy_checks = healthy_checks.clone();
            manager
                .listen_event("g1", "good", move || {
                    healthy_checks.fetch_add(1, Ordering::SeqCst);
                    false
                })
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(healthy_checks.load(Ordering::SeqCst) >= 3);
        assert!(manager.is_polling(&OwnerId::new("g1")));
    }

    #[tokio::test]
    async fn test_release_stops_poller_and_waiters() {
        let manager = fast_manager();
        let owner = OwnerId::new("g1");
        let lock = manager.listen_event(&owner, "w1", || false).unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.wait().await })
        };
        wait_for_waiters(&lock, 1).await;

        assert!(manager.release(&owner));
        let woke = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("release should cancel waiter")
            .unwrap();
        assert!(!woke);
        assert!(!manager.is_polling(&owner));
        assert!(!manager.release(&owner));
    }

    #[tokio::test]
    async fn test_single_poller_per_owner() {
        let manager = fast_manager();
        manager.listen_event("g1", "a", || false).unwrap();
        manager.listen_event("g1", "b", || false).unwrap();
        assert!(manager.remove_listener(&OwnerId::new("g1"), "a"));
        assert!(!manager.remove_listener(&OwnerId::new("g1"), "a"));
        assert!(manager.is_polling(&OwnerId::new("g1")));
        assert_eq!(manager.owner_count(), 1);
    }
}
