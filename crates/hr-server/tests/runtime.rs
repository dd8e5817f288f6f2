//! Runtime wiring: configured processes, persisted state and graphs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hr_config::RuntimeConfig;
use hr_core::keys;
use hr_process::{JsonRecordStore, ProcessRecord, ProcessStatus};
use hr_server::Runtime;
use hr_workspace::{BlockGraph, BlockNode};
use tempfile::TempDir;

fn config(storage: &std::path::Path, processes: &str) -> RuntimeConfig {
    let mut config = RuntimeConfig::from_yaml(&format!(
        "locks:\n  poll_interval_ms: 20\nscheduler:\n  tick_ms: 10\n  min_period_ms: 20\nprocesses:\n{}",
        processes
    ))
    .unwrap();
    config.storage.dir = storage.to_path_buf();
    config
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_periodic_broadcast_wakes_graph() {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new(config(
        dir.path(),
        "  - id: heartbeat\n    kind: broadcast\n    period_ms: 30\n    auto_start: true\n    params: { key: heartbeat }\n",
    ));

    let beats = Arc::new(AtomicUsize::new(0));
    let counter = beats.clone();
    runtime.run_graph(BlockGraph::new(
        "monitor",
        runtime.locks().clone(),
        vec![BlockNode::when_event("on-beat", "heartbeat").with_child(BlockNode::command(
            "count",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ))],
    ));
    let lock = runtime.locks().get_or_create_lock("monitor", "heartbeat");
    wait_for("hat to wait", || lock.waiter_count() > 0).await;

    runtime.start().await.unwrap();
    wait_for("two beats", || beats.load(Ordering::SeqCst) >= 2).await;

    let record = runtime.scheduler().record("heartbeat").unwrap();
    assert_eq!(record.status, ProcessStatus::Running);
    assert!(record.run_count >= 2);

    runtime.shutdown();
    assert_eq!(runtime.graph_count(), 0);
    assert!(lock.is_cancelled());
}

#[tokio::test]
async fn test_failed_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let store = JsonRecordStore::new(dir.path());
    let mut failed = ProcessRecord::new("beacon", "broadcast");
    failed.status = ProcessStatus::Failed;
    failed.error_message = Some("antenna down".to_string());
    failed.run_count = 4;
    store.save(&failed).unwrap();

    let runtime = Runtime::new(config(
        dir.path(),
        "  - id: beacon\n    kind: broadcast\n    period_ms: 20\n    auto_start: true\n    params: { key: beacon }\n",
    ));
    runtime.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = runtime.scheduler().record("beacon").unwrap();
    assert_eq!(record.status, ProcessStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("antenna down"));
    assert_eq!(record.run_count, 4);

    runtime.shutdown();
}

#[tokio::test]
async fn test_live_process_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let store = JsonRecordStore::new(dir.path());
    let mut live = ProcessRecord::new("once", "broadcast");
    live.status = ProcessStatus::Running;
    live.run_count = 1;
    store.save(&live).unwrap();

    // Not auto-started, but it was live when the runtime went down
    let runtime = Runtime::new(config(
        dir.path(),
        "  - id: once\n    kind: broadcast\n    params: { key: once }\n",
    ));
    runtime.start().await.unwrap();

    let scheduler = runtime.scheduler().clone();
    wait_for("resumed run", || {
        scheduler.record("once").map(|r| r.run_count) == Some(2)
    })
    .await;
    assert_eq!(scheduler.status("once"), Some(ProcessStatus::Running));

    runtime.shutdown();
}

#[tokio::test]
async fn test_unknown_kind_fails_startup() {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new(config(dir.path(), "  - id: x\n    kind: teleport\n"));

    let err = runtime.start().await.unwrap_err();
    assert!(format!("{:#}", err).contains("teleport"));
}

#[tokio::test]
async fn test_start_and_shutdown_are_announced() {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new(config(dir.path(), "  []\n"));
    let mut events = runtime.locks().subscribe();

    runtime.start().await.unwrap();
    runtime.shutdown();

    assert_eq!(events.recv().await.unwrap().key, keys::RUNTIME_STARTED);
    assert_eq!(events.recv().await.unwrap().key, keys::RUNTIME_STOPPING);
}

#[tokio::test]
async fn test_run_graph_replaces_same_owner() {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new(config(dir.path(), "  []\n"));

    let graph = |locks| {
        BlockGraph::new(
            "porch",
            locks,
            vec![BlockNode::when_event("on-dusk", "dusk")],
        )
    };
    let first = runtime.run_graph(graph(runtime.locks().clone()));
    let second = runtime.run_graph(graph(runtime.locks().clone()));

    assert!(first.is_released());
    assert!(!second.is_released());
    assert_eq!(runtime.graph_count(), 1);

    // The replacement owns the scope once the old graph has finished
    tokio::time::timeout(Duration::from_secs(2), first.finished())
        .await
        .unwrap();
    let lock = runtime.locks().get_or_create_lock("porch", "dusk");
    wait_for("replacement hat to wait", || lock.waiter_count() > 0).await;
    assert!(!second.is_finished());

    runtime.shutdown();
    assert!(second.is_released());
    assert!(lock.is_cancelled());
}
