//! Process record
//!
//! A [`ProcessRecord`] is the persisted state of one registered background
//! process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::status::ProcessStatus;

/// How the next periodic run is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// Period counted from the end of the previous run
    #[default]
    FixedDelay,
    /// Period counted from the start of the previous run
    FixedRate,
}

/// Persisted state of a background process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Unique process id
    pub id: String,

    /// Factory tag the process implementation was built from
    pub kind: String,

    /// Current lifecycle status
    #[serde(default)]
    pub status: ProcessStatus,

    /// Message of the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Re-invocation interval in milliseconds; 0 runs once per start
    #[serde(default)]
    pub period_ms: u64,

    /// Launch without an explicit start
    #[serde(default)]
    pub auto_start: bool,

    /// Delay or rate scheduling
    #[serde(default)]
    pub schedule_mode: ScheduleMode,

    /// Registration timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Completion time of the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,

    /// Number of completed runs
    #[serde(default)]
    pub run_count: u64,
}

impl ProcessRecord {
    /// Create a new record in the `NeverRun` status
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            status: ProcessStatus::NeverRun,
            error_message: None,
            period_ms: 0,
            auto_start: false,
            schedule_mode: ScheduleMode::FixedDelay,
            created_at: Utc::now(),
            last_run_at: None,
            run_count: 0,
        }
    }

    /// Set the re-invocation period
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set auto start
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Set schedule mode
    pub fn with_schedule_mode(mut self, mode: ScheduleMode) -> Self {
        self.schedule_mode = mode;
        self
    }

    /// Re-invocation interval; zero means run once per explicit start
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Whether the process is re-invoked periodically
    pub fn is_periodic(&self) -> bool {
        self.period_ms > 0
    }

    /// Carry status and run history over from a previously saved record
    ///
    /// A process saved while live resumes as `Restarting`, so it is launched
    /// once more after a runtime restart. Configuration fields (period,
    /// auto start, schedule mode) keep their current values.
    pub fn restore_from(&mut self, saved: &ProcessRecord) {
        self.status = match saved.status {
            ProcessStatus::Running | ProcessStatus::Restarting => ProcessStatus::Restarting,
            other => other,
        };
        self.error_message = saved.error_message.clone();
        self.created_at = saved.created_at;
        self.last_run_at = saved.last_run_at;
        self.run_count = saved.run_count;
    }
}
