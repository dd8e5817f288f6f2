//! Process status state machine
//!
//! Every status change of a background process is validated here:
//!
//! ```text
//! NeverRun → Running ⇄ Restarting
//!               ↘ Failed → Running (explicit restart)
//!
//! any → Stop → Running (explicit start)
//! ```
//!
//! No status is terminal. Nothing returns to `NeverRun`, and only a process
//! that is (re)starting can fail.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle status of a background process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Registered, never launched
    #[default]
    NeverRun,
    /// Launched or due for periodic re-invocation
    Running,
    /// Restart requested; relaunched on the next scheduler pass
    Restarting,
    /// Stopped by an operator
    Stop,
    /// Last run failed; cleared only by an explicit restart
    Failed,
}

impl ProcessStatus {
    /// Whether the scheduler treats the process as live
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessStatus::Running | ProcessStatus::Restarting)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessStatus::NeverRun => "never_run",
            ProcessStatus::Running => "running",
            ProcessStatus::Restarting => "restarting",
            ProcessStatus::Stop => "stop",
            ProcessStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Error when an invalid status transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid status transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ProcessStatus,
    pub to: ProcessStatus,
    pub reason: &'static str,
}

impl ProcessStatus {
    /// Attempt a transition to a new status.
    ///
    /// Returns the new status if valid, or an error describing why the
    /// transition is invalid. A transition to the current status is a valid
    /// no-op.
    pub fn try_transition(self, to: ProcessStatus) -> Result<ProcessStatus, InvalidTransition> {
        use ProcessStatus::*;

        let valid = match (self, to) {
            (from, to) if from == to => true,

            // NeverRun is only ever the initial status
            (_, NeverRun) => false,

            // Start, explicit restart and launch of a restarting process
            (_, Running) => true,

            // Only a running process restarts in place
            (Running, Restarting) => true,
            (_, Restarting) => false,

            // Any process can be stopped
            (_, Stop) => true,

            // Only a live process can fail
            (Running | Restarting, Failed) => true,
            (_, Failed) => false,
        };

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    /// Check if a transition is valid without performing it
    pub fn can_transition_to(self, to: ProcessStatus) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: ProcessStatus, to: ProcessStatus) -> &'static str {
        use ProcessStatus::*;

        match (from, to) {
            (_, NeverRun) => "NeverRun is initial only - a process cannot return to it",
            (NeverRun, Restarting) => "Process never ran - start it instead of restarting",
            (Stop, Restarting) => "Process is stopped - start it instead of restarting",
            (Failed, Restarting) => "Process failed - restart moves it straight to Running",
            (NeverRun, Failed) => "Process never ran - it cannot have failed",
            (Stop, Failed) => "Process is stopped - only a live process can fail",
            _ => "Invalid status transition",
        }
    }
}
