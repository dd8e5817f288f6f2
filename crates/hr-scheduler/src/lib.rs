//! Process scheduler
//!
//! This crate provides the tick-driven coordinator that launches background
//! processes when they should start and are due, and re-invokes periodic
//! processes while they keep running.

mod error;
mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{
    Scheduler, SchedulerConfig, DEFAULT_MIN_PERIOD, DEFAULT_TICK, INCONSISTENT_STOP,
};
