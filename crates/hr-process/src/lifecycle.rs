//! Process lifecycle
//!
//! [`ProcessLifecycle`] couples one [`BackgroundProcess`] with its
//! [`ProcessRecord`]. Every status change goes through
//! [`ProcessLifecycle::set_status`], which validates it against the status
//! table and persists the record through the injected save callback.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ProcessError, ProcessResult};
use crate::process::{BackgroundProcess, ProcessContext};
use crate::record::{ProcessRecord, ScheduleMode};
use crate::status::ProcessStatus;

/// Persistence callback invoked synchronously on every record change
///
/// The callback runs while the record is locked and must not call back into
/// the lifecycle. It also runs on the caller's thread, so blocking I/O in it
/// (such as [`JsonRecordStore::save_record`](crate::JsonRecordStore::save_record))
/// stalls the async worker for the duration of the write.
pub type SaveRecord = Arc<dyn Fn(&ProcessRecord) -> Result<(), String> + Send + Sync + 'static>;

/// Lifecycle of one background process
pub struct ProcessLifecycle {
    id: String,
    process: Arc<dyn BackgroundProcess>,
    record: Mutex<ProcessRecord>,
    save: Option<SaveRecord>,
    pending_start: AtomicBool,
    current_run: Mutex<Option<CancellationToken>>,
}

impl ProcessLifecycle {
    /// Create a lifecycle without persistence
    pub fn new(record: ProcessRecord, process: Arc<dyn BackgroundProcess>) -> Self {
        Self {
            id: record.id.clone(),
            process,
            record: Mutex::new(record),
            save: None,
            pending_start: AtomicBool::new(false),
            current_run: Mutex::new(None),
        }
    }

    /// Persist every record change through `save`
    pub fn with_save(mut self, save: SaveRecord) -> Self {
        self.save = Some(save);
        self
    }

    /// Process id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the underlying process implementation
    pub fn name(&self) -> &str {
        self.process.name()
    }

    fn lock_record(&self) -> MutexGuard<'_, ProcessRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, record: &ProcessRecord) -> ProcessResult<()> {
        match &self.save {
            Some(save) => save(record).map_err(|message| ProcessError::Persistence {
                id: self.id.clone(),
                message,
            }),
            None => Ok(()),
        }
    }

    /// Snapshot of the current record
    pub fn record(&self) -> ProcessRecord {
        self.lock_record().clone()
    }

    /// Current status
    pub fn status(&self) -> ProcessStatus {
        self.lock_record().status
    }

    /// Re-invocation interval; zero means run once per explicit start
    pub fn period(&self) -> Duration {
        self.lock_record().period()
    }

    /// Delay or rate scheduling
    pub fn schedule_mode(&self) -> ScheduleMode {
        self.lock_record().schedule_mode
    }

    /// `can_work` with errors counted as "cannot work"
    pub fn can_work_safe(&self) -> bool {
        match self.process.can_work() {
            Ok(can_work) => can_work,
            Err(e) => {
                warn!(process_id = %self.id, error = %e, "Unable to check if process can work");
                false
            }
        }
    }

    /// Why the process cannot work, if it reports a reason
    pub fn why_cannot_work(&self) -> Option<String> {
        self.process.why_cannot_work()
    }

    /// Whether the scheduler may launch the process now
    ///
    /// Stopped and failed processes never start on their own. Otherwise the
    /// process must be able to work and be either live or auto-started.
    pub fn should_start_now(&self) -> bool {
        let (status, auto_start) = {
            let record = self.lock_record();
            (record.status, record.auto_start)
        };

        if matches!(status, ProcessStatus::Stop | ProcessStatus::Failed) {
            return false;
        }
        if !self.can_work_safe() {
            return false;
        }
        status.is_active() || auto_start
    }

    /// Validate, apply and persist a status change
    ///
    /// Setting the current status with the same message is a no-op and is
    /// not persisted. When persisting fails the in-memory status has already
    /// changed.
    pub fn set_status(
        &self,
        status: ProcessStatus,
        error_message: Option<String>,
    ) -> ProcessResult<()> {
        let mut record = self.lock_record();
        let from = record.status;
        from.try_transition(status)?;

        if from == status && record.error_message == error_message {
            return Ok(());
        }

        record.status = status;
        record.error_message = error_message;

        if from != status {
            info!(
                process_id = %self.id,
                from = %from,
                to = %status,
                "Process status changed"
            );
        }

        self.persist(&record)
    }

    /// Whether an explicit start is waiting to be launched
    pub fn has_pending_start(&self) -> bool {
        self.pending_start.load(Ordering::SeqCst)
    }

    /// Whether a run is currently in flight
    pub fn is_executing(&self) -> bool {
        self.current_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn cancel_current_run(&self) {
        if let Some(token) = self
            .current_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            debug!(process_id = %self.id, "Cancelling in-flight run");
            token.cancel();
        }
    }

    fn fail(&self, message: String) -> ProcessResult<()> {
        error!(process_id = %self.id, error = %message, "Process failed");
        self.set_status(ProcessStatus::Failed, Some(message.clone()))?;
        Err(ProcessError::Execution {
            id: self.id.clone(),
            message,
        })
    }

    /// Explicit start by an operator
    ///
    /// Moves the process to `Running`, runs `before_start` and marks a start
    /// as pending so the scheduler launches it on its next pass.
    pub async fn start(&self) -> ProcessResult<()> {
        self.set_status(ProcessStatus::Running, None)?;

        if let Err(e) = self.process.before_start().await {
            return self.fail(format!("{:#}", e));
        }

        self.pending_start.store(true, Ordering::SeqCst);
        info!(process_id = %self.id, "Process started");
        Ok(())
    }

    /// Explicit restart
    ///
    /// A running process moves to `Restarting` and its in-flight run is
    /// cancelled. Any other process is started.
    pub async fn restart(&self) -> ProcessResult<()> {
        match self.status() {
            ProcessStatus::Running => {
                self.set_status(ProcessStatus::Restarting, None)?;
                self.cancel_current_run();
                Ok(())
            }
            ProcessStatus::Restarting => Ok(()),
            _ => self.start().await,
        }
    }

    /// Explicit stop
    ///
    /// Cancels the in-flight run and calls `after_stop`. The process ends in
    /// `Stop`, or in `Failed` when `after_stop` errors and the current status
    /// allows it.
    pub async fn stop(&self) -> ProcessResult<()> {
        self.pending_start.store(false, Ordering::SeqCst);
        self.cancel_current_run();

        match self.process.after_stop().await {
            Ok(()) => {
                self.set_status(ProcessStatus::Stop, None)?;
                info!(process_id = %self.id, "Process stopped");
                Ok(())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(process_id = %self.id, error = %message, "Process stop failed");
                let status = if self.status().can_transition_to(ProcessStatus::Failed) {
                    ProcessStatus::Failed
                } else {
                    ProcessStatus::Stop
                };
                self.set_status(status, Some(message.clone()))?;
                Err(ProcessError::Execution {
                    id: self.id.clone(),
                    message,
                })
            }
        }
    }

    /// Stop a live process that can no longer work
    ///
    /// Cancels the in-flight run, moves the process to `Stop` with `reason`
    /// and then calls `after_stop`, whose error is only logged. Returns
    /// `false` when the process was not live.
    pub async fn halt(&self, reason: &str) -> ProcessResult<bool> {
        if !self.status().is_active() {
            return Ok(false);
        }
        self.pending_start.store(false, Ordering::SeqCst);
        self.cancel_current_run();
        self.set_status(ProcessStatus::Stop, Some(reason.to_string()))?;
        warn!(process_id = %self.id, reason, "Process halted");

        if let Err(e) = self.process.after_stop().await {
            warn!(process_id = %self.id, error = %format!("{:#}", e), "after_stop failed on halt");
        }
        Ok(true)
    }

    /// Run the work once
    ///
    /// A `NeverRun` or `Restarting` process is moved to `Running` first. On
    /// success the status is unchanged and the run is counted. An error or a
    /// panic moves the process to `Failed`, unless the run was cancelled or
    /// the process is no longer live. There is no automatic retry. A stop or
    /// restart while `before_start` is pending ends the call without running
    /// the work.
    pub async fn execute(&self, cancel: CancellationToken) -> ProcessResult<()> {
        let status = self.status();
        if matches!(status, ProcessStatus::Stop | ProcessStatus::Failed) {
            debug!(process_id = %self.id, "Process not live, skipping run");
            return Ok(());
        }

        // Registered before any await so stop and restart can cancel setup too
        self.set_current_run(Some(cancel.clone()));

        if matches!(status, ProcessStatus::NeverRun | ProcessStatus::Restarting) {
            if let Err(e) = self.set_status(ProcessStatus::Running, None) {
                self.set_current_run(None);
                return Err(e);
            }
            if let Err(e) = self.process.before_start().await {
                self.set_current_run(None);
                if self.was_interrupted(&cancel) {
                    debug!(process_id = %self.id, error = %e, "Setup ended after cancellation");
                    return Ok(());
                }
                return self.fail(format!("{:#}", e));
            }
        }

        if self.was_interrupted(&cancel) {
            self.set_current_run(None);
            debug!(process_id = %self.id, status = %self.status(), "Run cancelled before start");
            return Ok(());
        }
        self.pending_start.store(false, Ordering::SeqCst);

        let run = self.lock_record().run_count + 1;
        let ctx = ProcessContext::new(self.id.clone(), run, cancel.clone());
        debug!(process_id = %self.id, run, "Process run started");

        let outcome = AssertUnwindSafe(self.process.run(ctx)).catch_unwind().await;
        self.set_current_run(None);

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(panic) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
        };

        match failure {
            None => {
                self.complete_run();
                Ok(())
            }
            Some(message) if self.was_interrupted(&cancel) => {
                debug!(process_id = %self.id, error = %message, "Run ended after cancellation");
                Ok(())
            }
            Some(message) => self.fail(message),
        }
    }

    fn set_current_run(&self, token: Option<CancellationToken>) {
        *self
            .current_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Cancelled, or moved out of `Running` by stop or restart
    fn was_interrupted(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.status() != ProcessStatus::Running
    }

    fn complete_run(&self) {
        let mut record = self.lock_record();
        record.last_run_at = Some(Utc::now());
        record.run_count += 1;
        debug!(process_id = %self.id, run = record.run_count, "Process run completed");

        if let Err(e) = self.persist(&record) {
            warn!(process_id = %self.id, error = %e, "Unable to persist run");
        }
    }
}

impl fmt::Debug for ProcessLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLifecycle")
            .field("id", &self.id)
            .field("name", &self.process.name())
            .field("record", &*self.lock_record())
            .finish()
    }
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
