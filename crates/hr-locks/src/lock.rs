//! Named condition lock
//!
//! A [`Lock`] wakes every caller currently suspended in [`Lock::wait`] when
//! [`Lock::signal_all`] is called. Signals are not buffered: a caller that
//! starts waiting after a signal fired does not observe it.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use hr_core::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A named condition variable scoped to one owner
///
/// The lock is cancelled together with its owner. Once cancelled, pending and
/// future calls to [`wait`](Lock::wait) return `false` immediately.
pub struct Lock {
    key: String,
    notify: Notify,
    last_value: RwLock<Option<Value>>,
    waiters: AtomicUsize,
    cancel: CancellationToken,
}

impl Lock {
    /// Create a lock bound to the given cancellation token
    pub fn new(key: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            key: key.into(),
            notify: Notify::new(),
            last_value: RwLock::new(None),
            waiters: AtomicUsize::new(0),
            cancel,
        }
    }

    /// The key this lock is registered under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Suspend until the lock is signalled or cancelled
    ///
    /// Returns `true` on a normal wake and `false` when the owner was
    /// released. Wakes carry no predicate: callers that need a specific
    /// condition must re-check it after waking.
    pub async fn wait(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        // Registered from creation, so a signal racing with the select below
        // is still observed.
        let notified = self.notify.notified();
        let _waiter = WaiterGuard::register(&self.waiters);
        trace!(key = %self.key, "Waiting on lock");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = notified => !self.cancel.is_cancelled(),
        }
    }

    /// Store `value` as the last value and wake every current waiter
    pub fn signal_all(&self, value: Option<Value>) {
        *self
            .last_value
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value;
        trace!(
            key = %self.key,
            waiters = self.waiter_count(),
            "Signalling lock"
        );
        self.notify.notify_waiters();
    }

    /// The payload of the most recent signal
    pub fn last_value(&self) -> Option<Value> {
        self.last_value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of callers currently suspended in [`wait`](Lock::wait)
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Whether the owning scope has been released
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("waiters", &self.waiter_count())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn register(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
