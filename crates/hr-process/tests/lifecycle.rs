//! Lifecycle scenarios with persistence

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use hr_process::{
    BackgroundProcess, JsonRecordStore, ProcessContext, ProcessError, ProcessLifecycle,
    ProcessRecord, ProcessStatus,
};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

struct Boom;

#[async_trait]
impl BackgroundProcess for Boom {
    fn name(&self) -> &str {
        "boom"
    }

    async fn run(&self, _ctx: ProcessContext) -> anyhow::Result<()> {
        Err(anyhow!("boom"))
    }
}

struct Panicky;

#[async_trait]
impl BackgroundProcess for Panicky {
    fn name(&self) -> &str {
        "panicky"
    }

    async fn run(&self, _ctx: ProcessContext) -> anyhow::Result<()> {
        panic!("wires crossed");
    }
}

/// Runs until cancelled, then reports an error
#[derive(Default)]
struct LongRunning {
    stops: AtomicUsize,
}

#[async_trait]
impl BackgroundProcess for LongRunning {
    fn name(&self) -> &str {
        "long-running"
    }

    async fn run(&self, ctx: ProcessContext) -> anyhow::Result<()> {
        if ctx.sleep(Duration::from_secs(60)).await {
            Ok(())
        } else {
            Err(anyhow!("interrupted"))
        }
    }

    async fn after_stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Slow setup, counts the runs that actually happen
#[derive(Default)]
struct SlowSetup {
    setups: AtomicUsize,
    runs: AtomicUsize,
}

#[async_trait]
impl BackgroundProcess for SlowSetup {
    fn name(&self) -> &str {
        "slow-setup"
    }

    async fn before_start(&self) -> anyhow::Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn run(&self, _ctx: ProcessContext) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StubbornStop;

#[async_trait]
impl BackgroundProcess for StubbornStop {
    fn name(&self) -> &str {
        "stubborn"
    }

    async fn run(&self, _ctx: ProcessContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_stop(&self) -> anyhow::Result<()> {
        Err(anyhow!("relay stuck"))
    }
}

#[tokio::test]
async fn test_failed_run_is_persisted() {
    let temp_dir = TempDir::new().unwrap();
    let store = JsonRecordStore::new(temp_dir.path());

    let lifecycle = ProcessLifecycle::new(
        ProcessRecord::new("p1", "boom").with_auto_start(true),
        Arc::new(Boom),
    )
    .with_save(store.save_record());

    assert!(lifecycle.should_start_now());
    let err = assert_err!(lifecycle.execute(CancellationToken::new()).await);
    assert!(matches!(err, ProcessError::Execution { .. }));

    let saved = store.load("p1").await.unwrap().unwrap();
    assert_eq!(saved.status, ProcessStatus::Failed);
    assert_eq!(saved.error_message.as_deref(), Some("boom"));

    // Failed is never started automatically
    assert!(!lifecycle.should_start_now());
}

#[tokio::test]
async fn test_panic_is_captured_as_failure() {
    let lifecycle = ProcessLifecycle::new(ProcessRecord::new("p1", "panicky"), Arc::new(Panicky));

    let err = lifecycle.execute(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ProcessError::Execution { .. }));

    let record = lifecycle.record();
    assert_eq!(record.status, ProcessStatus::Failed);
    assert!(record
        .error_message
        .unwrap()
        .contains("wires crossed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_during_run_ends_in_stop() {
    let process = Arc::new(LongRunning::default());
    let lifecycle = Arc::new(ProcessLifecycle::new(
        ProcessRecord::new("p1", "long-running"),
        process.clone(),
    ));

    let run = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.execute(CancellationToken::new()).await })
    };

    for _ in 0..200 {
        if lifecycle.is_executing() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(lifecycle.is_executing());

    lifecycle.stop().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run should observe the stop")
        .unwrap();

    assert!(result.is_ok());
    assert_eq!(lifecycle.status(), ProcessStatus::Stop);
    assert!(lifecycle.record().error_message.is_none());
    assert_eq!(process.stops.load(Ordering::SeqCst), 1);
}

async fn wait_for_setup(process: &SlowSetup) {
    for _ in 0..200 {
        if process.setups.load(Ordering::SeqCst) > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("before_start never began");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_during_setup_skips_the_run() {
    let process = Arc::new(SlowSetup::default());
    let lifecycle = Arc::new(ProcessLifecycle::new(
        ProcessRecord::new("p1", "slow-setup"),
        process.clone(),
    ));
    let token = CancellationToken::new();

    let run = {
        let lifecycle = lifecycle.clone();
        let token = token.clone();
        tokio::spawn(async move { lifecycle.execute(token).await })
    };
    wait_for_setup(&process).await;
    assert!(lifecycle.is_executing());

    assert_ok!(lifecycle.stop().await);
    assert!(token.is_cancelled());

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("execute should return after setup")
        .unwrap();

    assert_ok!(result);
    assert_eq!(process.runs.load(Ordering::SeqCst), 0);
    assert_eq!(lifecycle.status(), ProcessStatus::Stop);
    assert_eq!(lifecycle.record().run_count, 0);
    assert!(!lifecycle.is_executing());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_during_setup_leaves_restarting() {
    let process = Arc::new(SlowSetup::default());
    let lifecycle = Arc::new(ProcessLifecycle::new(
        ProcessRecord::new("p1", "slow-setup"),
        process.clone(),
    ));

    let run = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.execute(CancellationToken::new()).await })
    };
    wait_for_setup(&process).await;

    assert_ok!(lifecycle.restart().await);
    assert_eq!(lifecycle.status(), ProcessStatus::Restarting);

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("execute should return after setup")
        .unwrap();

    assert_ok!(result);
    assert_eq!(process.runs.load(Ordering::SeqCst), 0);
    // The next launch picks the restart up
    assert_eq!(lifecycle.status(), ProcessStatus::Restarting);
    assert!(lifecycle.should_start_now());
}

#[tokio::test]
async fn test_after_stop_error_fails_running_process() {
    let lifecycle = ProcessLifecycle::new(ProcessRecord::new("p1", "stubborn"), Arc::new(StubbornStop));
    lifecycle.start().await.unwrap();

    let err = lifecycle.stop().await.unwrap_err();
    assert!(matches!(err, ProcessError::Execution { .. }));
    assert_eq!(lifecycle.status(), ProcessStatus::Failed);
    assert_eq!(
        lifecycle.record().error_message.as_deref(),
        Some("relay stuck")
    );
}

#[tokio::test]
async fn test_restart_after_failure_runs_again() {
    let lifecycle = ProcessLifecycle::new(ProcessRecord::new("p1", "boom"), Arc::new(Boom));
    lifecycle.start().await.unwrap();
    let _ = lifecycle.execute(CancellationToken::new()).await;
    assert_eq!(lifecycle.status(), ProcessStatus::Failed);

    lifecycle.restart().await.unwrap();
    assert_eq!(lifecycle.status(), ProcessStatus::Running);
    assert!(lifecycle.record().error_message.is_none());
    assert!(lifecycle.should_start_now());
}
