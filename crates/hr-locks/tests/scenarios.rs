//! End-to-end lock manager scenarios
//!
//! These tests run against the default one-second poll interval so that the
//! timings match what a deployed runtime observes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hr_core::OwnerId;
use hr_locks::{Lock, LockManager};
use serde_json::json;

async fn wait_for_waiters(lock: &Lock, expected: usize) {
    for _ in 0..400 {
        if lock.waiter_count() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} waiters on '{}'", expected, lock.key());
}

// ============================================================================
// Polled conditions
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_polled_condition_wakes_within_one_tick() {
    let manager = LockManager::new();
    let flag = Arc::new(AtomicBool::new(false));

    let lock = {
        let flag = flag.clone();
        manager
            .listen_event("graph-1", "w1", move || flag.load(Ordering::SeqCst))
            .unwrap()
    };

    let waiter = {
        let lock = lock.clone();
        tokio::spawn(async move { lock.wait().await })
    };
    wait_for_waiters(&lock, 1).await;

    let flipped_at = Instant::now();
    flag.store(true, Ordering::SeqCst);

    let woke = tokio::time::timeout(Duration::from_secs(3), waiter)
        .await
        .expect("waiter should wake on the next poller tick")
        .unwrap();

    assert!(woke);
    // One poll interval plus scheduling slack
    let elapsed = flipped_at.elapsed();
    assert!(
        elapsed < Duration::from_millis(1100),
        "woke {:?} after the flip",
        elapsed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_wakes_waiter_with_false() {
    let manager = LockManager::new();
    let owner = OwnerId::new("graph-1");
    let lock = manager.listen_event(&owner, "never", || false).unwrap();

    let waiter = {
        let lock = lock.clone();
        tokio::spawn(async move { lock.wait().await })
    };
    wait_for_waiters(&lock, 1).await;

    assert!(manager.release(&owner));
    // Second release is a no-op
    assert!(!manager.release(&owner));

    let woke = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("release should cancel the waiter")
        .unwrap();
    assert!(!woke);
    assert!(!manager.has_owner(&owner));
}

// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fire_event_wakes_every_owner_once() {
    let manager = LockManager::new();
    let a = manager.get_or_create_lock("graph-a", "alarm");
    let b = manager.get_or_create_lock("graph-b", "alarm");

    let wait_a = {
        let a = a.clone();
        tokio::spawn(async move { a.wait().await })
    };
    let wait_b = {
        let b = b.clone();
        tokio::spawn(async move { b.wait().await })
    };
    wait_for_waiters(&a, 1).await;
    wait_for_waiters(&b, 1).await;

    let mut events = manager.subscribe();
    assert!(manager.fire_event("alarm", Some(json!(1))).unwrap());

    for handle in [wait_a, wait_b] {
        let woke = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("broadcast should wake both owners")
            .unwrap();
        assert!(woke);
    }
    assert_eq!(a.last_value(), Some(json!(1)));
    assert_eq!(b.last_value(), Some(json!(1)));

    // Repeating the same value is collapsed
    assert!(!manager.fire_event("alarm", Some(json!(1))).unwrap());

    let event = events.recv().await.unwrap();
    assert_eq!(event.key, "alarm");
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_released_owner_is_not_signalled() {
    let manager = LockManager::new();
    manager.get_or_create_lock("graph-a", "alarm");
    manager.get_or_create_lock("graph-b", "alarm");

    manager.release(&OwnerId::new("graph-a"));
    assert_eq!(manager.signal_all("alarm", None), 1);
}
