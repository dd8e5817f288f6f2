//! The wired runtime
//!
//! Owns the lock manager, the scheduler, the process registry, the record
//! store and every running block graph.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use dashmap::DashMap;
use hr_config::{ProcessConfig, RuntimeConfig, ScheduleModeConfig};
use hr_core::{keys, OwnerId};
use hr_locks::{LockManager, LockManagerConfig, SharedLockManager};
use hr_process::{JsonRecordStore, ProcessLifecycle, ProcessRecord, ProcessRegistry, ScheduleMode};
use hr_scheduler::{Scheduler, SchedulerConfig};
use hr_workspace::{BlockGraph, GraphHandle};
use tracing::{debug, error, info, warn};

use crate::processes::builtin_registry;

/// The automation runtime
pub struct Runtime {
    config: RuntimeConfig,
    locks: SharedLockManager,
    scheduler: Arc<Scheduler>,
    registry: ProcessRegistry,
    store: JsonRecordStore,
    graphs: Arc<DashMap<OwnerId, GraphHandle>>,
}

impl Runtime {
    /// Build every component from the configuration; nothing runs yet
    pub fn new(config: RuntimeConfig) -> Self {
        let locks = Arc::new(LockManager::with_config(LockManagerConfig {
            poll_interval: config.locks.poll_interval(),
            event_capacity: config.locks.event_capacity,
        }));
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
            tick: config.scheduler.tick(),
            min_period: config.scheduler.min_period(),
        }));
        let registry = builtin_registry(locks.clone());
        let store = JsonRecordStore::new(&config.storage.dir);

        Self {
            config,
            locks,
            scheduler,
            registry,
            store,
            graphs: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn locks(&self) -> &SharedLockManager {
        &self.locks
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Registry of process kinds; register custom kinds before [`start`](Runtime::start)
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Register every configured process, restoring saved state
    ///
    /// Saved records without a configured process are left on disk untouched.
    pub async fn register_processes(&self) -> Result<usize> {
        let mut saved: HashMap<String, ProcessRecord> = self
            .store
            .load_all()
            .await
            .context("failed to load saved process records")?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        for process in &self.config.processes {
            let lifecycle = self.build_lifecycle(process, saved.remove(&process.id))?;
            self.scheduler
                .register(lifecycle)
                .with_context(|| format!("failed to register process '{}'", process.id))?;
        }

        for id in saved.keys() {
            debug!(process_id = %id, "Saved record has no configured process");
        }
        Ok(self.config.processes.len())
    }

    fn build_lifecycle(
        &self,
        process: &ProcessConfig,
        saved: Option<ProcessRecord>,
    ) -> Result<ProcessLifecycle> {
        let implementation = self
            .registry
            .create(&process.kind, &process.params)
            .with_context(|| format!("failed to create process '{}'", process.id))?;

        let mut record = ProcessRecord::new(&process.id, &process.kind)
            .with_period(process.period())
            .with_auto_start(process.auto_start)
            .with_schedule_mode(match process.schedule_mode {
                ScheduleModeConfig::FixedDelay => ScheduleMode::FixedDelay,
                ScheduleModeConfig::FixedRate => ScheduleMode::FixedRate,
            });
        if let Some(saved) = saved {
            if saved.kind == process.kind {
                record.restore_from(&saved);
                info!(process_id = %process.id, status = %record.status, "Restored process state");
            } else {
                warn!(
                    process_id = %process.id,
                    saved_kind = %saved.kind,
                    kind = %process.kind,
                    "Ignoring saved state of a different kind"
                );
            }
        }

        Ok(ProcessLifecycle::new(record, implementation).with_save(self.store.save_record()))
    }

    /// Run a block graph until it ends or the runtime shuts down
    ///
    /// A running graph with the same owner is released first; the new graph
    /// starts once the old one has finished.
    pub fn run_graph(&self, graph: BlockGraph) -> GraphHandle {
        let handle = graph.handle();
        let owner = handle.owner().clone();

        let previous = self.graphs.insert(owner.clone(), handle.clone());
        if let Some(previous) = &previous {
            info!(owner = %owner, "Replacing running block graph");
            previous.release();
        }

        let graphs = self.graphs.clone();
        tokio::spawn(async move {
            // The owner scope is shared, so the old graph must be fully gone
            if let Some(previous) = previous {
                previous.finished().await;
            }
            if let Err(e) = graph.start().await {
                error!(owner = %owner, error = %e, "Block graph failed");
            }
            // A replacement graph is still live and keeps its entry
            graphs.remove_if(&owner, |_, h| h.is_released());
        });
        handle
    }

    /// Number of graphs currently tracked
    pub fn graph_count(&self) -> usize {
        self.graphs.len()
    }

    /// Register processes, start the scheduler and announce startup
    pub async fn start(&self) -> Result<()> {
        let count = self.register_processes().await?;
        self.scheduler.start_loop();
        self.locks.fire_event(keys::RUNTIME_STARTED, None)?;
        info!(processes = count, "Runtime started");
        Ok(())
    }

    /// Announce shutdown, release every graph and stop the scheduler
    pub fn shutdown(&self) {
        if let Err(e) = self.locks.fire_event(keys::RUNTIME_STOPPING, None) {
            warn!(error = %e, "Failed to announce shutdown");
        }

        for entry in self.graphs.iter() {
            entry.value().release();
        }
        self.graphs.clear();
        self.scheduler.shutdown();
        info!("Runtime stopped");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("processes", &self.scheduler.len())
            .field("graphs", &self.graphs.len())
            .field("storage", &self.store.dir())
            .finish()
    }
}
