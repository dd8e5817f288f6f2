//! Process scheduler
//!
//! The [`Scheduler`] coordinates registered background processes. On every
//! tick it launches each process that should start now and is due, on its
//! own Tokio task, and computes the next run from the process period once
//! the run completes. A run in flight whose process can no longer work is
//! halted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hr_process::{ProcessError, ProcessLifecycle, ProcessRecord, ProcessStatus, ScheduleMode};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Default interval between two scheduler passes
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Default minimum period of a periodic process
pub const DEFAULT_MIN_PERIOD: Duration = Duration::from_secs(1);

/// Reason recorded when a live run loses its precondition
pub const INCONSISTENT_STOP: &str = "Inconsistency: process should be stopped";

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between two scheduler passes
    pub tick: Duration,
    /// Shortest accepted non-zero process period
    pub min_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            min_period: DEFAULT_MIN_PERIOD,
        }
    }
}

/// A registered process and its scheduling state
struct Scheduled {
    lifecycle: Arc<ProcessLifecycle>,
    next_run: Mutex<Option<Instant>>,
    in_flight: AtomicBool,
}

impl Scheduled {
    fn next_run(&self) -> Option<Instant> {
        *self.next_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_next_run(&self, next: Option<Instant>) {
        *self.next_run.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Whether the process is due, given it should start now
    fn is_due(&self, now: Instant) -> bool {
        let lifecycle = &self.lifecycle;
        match lifecycle.status() {
            ProcessStatus::NeverRun | ProcessStatus::Restarting => true,
            ProcessStatus::Running if lifecycle.has_pending_start() => true,
            ProcessStatus::Running if !lifecycle.period().is_zero() => {
                self.next_run().map_or(true, |next| next <= now)
            }
            _ => false,
        }
    }
}

/// Tick-driven coordinator of background processes
pub struct Scheduler {
    processes: DashMap<String, Arc<Scheduled>>,
    config: SchedulerConfig,
    /// Parent of every run's cancellation token
    runs: CancellationToken,
    /// Running flag
    running: Arc<AtomicBool>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            processes: DashMap::new(),
            config,
            runs: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Scheduler tuning
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a process
    ///
    /// Periodic processes must not run more often than the configured
    /// minimum period.
    pub fn register(&self, lifecycle: ProcessLifecycle) -> SchedulerResult<Arc<ProcessLifecycle>> {
        let id = lifecycle.id().to_string();
        let period = lifecycle.period();

        if !period.is_zero() && period < self.config.min_period {
            return Err(ProcessError::PeriodTooShort {
                id,
                period,
                min: self.config.min_period,
            }
            .into());
        }

        let lifecycle = Arc::new(lifecycle);
        match self.processes.entry(id.clone()) {
            Entry::Occupied(_) => Err(SchedulerError::AlreadyRegistered(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Scheduled {
                    lifecycle: lifecycle.clone(),
                    next_run: Mutex::new(None),
                    in_flight: AtomicBool::new(false),
                }));
                info!(
                    process_id = %id,
                    name = lifecycle.name(),
                    period = ?period,
                    "Registered process"
                );
                Ok(lifecycle)
            }
        }
    }

    /// Stop and remove a process
    pub async fn unregister(&self, id: &str) -> SchedulerResult<()> {
        let (_, scheduled) = self
            .processes
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        if let Err(e) = scheduled.lifecycle.stop().await {
            warn!(process_id = id, error = %e, "Process did not stop cleanly");
        }
        info!(process_id = id, "Unregistered process");
        Ok(())
    }

    fn get(&self, id: &str) -> SchedulerResult<Arc<Scheduled>> {
        self.processes
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    /// Lifecycle of a registered process
    pub fn lifecycle(&self, id: &str) -> Option<Arc<ProcessLifecycle>> {
        self.processes.get(id).map(|r| r.lifecycle.clone())
    }

    /// Explicitly start a process; it is launched on the next tick
    pub async fn start(&self, id: &str) -> SchedulerResult<()> {
        let scheduled = self.get(id)?;
        scheduled.lifecycle.start().await?;
        Ok(())
    }

    /// Explicitly restart a process
    pub async fn restart(&self, id: &str) -> SchedulerResult<()> {
        let scheduled = self.get(id)?;
        scheduled.lifecycle.restart().await?;
        Ok(())
    }

    /// Explicitly stop a process and cancel its in-flight run
    pub async fn stop(&self, id: &str) -> SchedulerResult<()> {
        let scheduled = self.get(id)?;
        scheduled.lifecycle.stop().await?;
        scheduled.set_next_run(None);
        Ok(())
    }

    /// Current status of a process
    pub fn status(&self, id: &str) -> Option<ProcessStatus> {
        self.processes.get(id).map(|r| r.lifecycle.status())
    }

    /// Snapshot of a process record
    pub fn record(&self, id: &str) -> Option<ProcessRecord> {
        self.processes.get(id).map(|r| r.lifecycle.record())
    }

    /// Snapshot of every process record, sorted by id
    pub fn records(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> =
            self.processes.iter().map(|r| r.lifecycle.record()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Number of registered processes
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether no process is registered
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Number of runs currently in flight
    pub fn in_flight(&self) -> usize {
        self.processes
            .iter()
            .filter(|r| r.in_flight.load(Ordering::SeqCst))
            .count()
    }

    /// One coordinator pass; returns the number of launched runs
    ///
    /// Must be called from within a Tokio runtime.
    pub fn tick(&self) -> usize {
        let now = Instant::now();
        let scheduled: Vec<Arc<Scheduled>> =
            self.processes.iter().map(|r| r.value().clone()).collect();

        let mut launched = 0;
        for entry in scheduled {
            // Claim the slot; a run in flight is never doubled
            if entry
                .in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.check_in_flight(&entry);
                continue;
            }

            if entry.lifecycle.should_start_now() && entry.is_due(now) {
                self.launch(entry);
                launched += 1;
            } else {
                entry.in_flight.store(false, Ordering::SeqCst);
            }
        }

        if launched > 0 {
            trace!(launched, "Scheduler tick");
        }
        launched
    }

    /// Halt an in-flight run whose process can no longer work
    fn check_in_flight(&self, entry: &Scheduled) {
        let lifecycle = &entry.lifecycle;
        if !lifecycle.status().is_active() || lifecycle.can_work_safe() {
            return;
        }

        let lifecycle = lifecycle.clone();
        let reason = lifecycle
            .why_cannot_work()
            .map(|why| format!("{}: {}", INCONSISTENT_STOP, why))
            .unwrap_or_else(|| INCONSISTENT_STOP.to_string());
        tokio::spawn(async move {
            if let Err(e) = lifecycle.halt(&reason).await {
                warn!(process_id = %lifecycle.id(), error = %e, "Failed to halt process");
            }
        });
    }

    fn launch(&self, entry: Arc<Scheduled>) {
        let cancel = self.runs.child_token();
        debug!(process_id = %entry.lifecycle.id(), "Launching process");

        tokio::spawn(async move {
            let started = Instant::now();
            if let Err(e) = entry.lifecycle.execute(cancel).await {
                debug!(process_id = %entry.lifecycle.id(), error = %e, "Run ended with error");
            }

            let period = entry.lifecycle.period();
            let next = if period.is_zero() {
                None
            } else {
                Some(match entry.lifecycle.schedule_mode() {
                    ScheduleMode::FixedDelay => Instant::now() + period,
                    ScheduleMode::FixedRate => started + period,
                })
            };
            entry.set_next_run(next);
            entry.in_flight.store(false, Ordering::SeqCst);
        });
    }

    /// Start the tick loop
    pub fn start_loop(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        info!(tick = ?self.config.tick, processes = self.len(), "Starting scheduler");

        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.tick();
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Received shutdown signal");
                        break;
                    }
                }
            }

            scheduler.running.store(false, Ordering::SeqCst);
            info!("Scheduler stopped");
        });
    }

    /// Stop the tick loop and cancel every in-flight run
    ///
    /// Statuses are left untouched, so live processes resume on the next
    /// startup.
    pub fn shutdown(&self) {
        self.runs.cancel();
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        info!(in_flight = self.in_flight(), "Stopping scheduler");
        let _ = self.shutdown_tx.send(());
    }

    /// Check if the tick loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
