//! Background processes
//!
//! This crate provides the lifecycle of long-running and periodic background
//! processes such as user scripts. A process moves through an explicit
//! status state machine; every change is validated in one place and
//! persisted through an injected callback.
//!
//! # Key Types
//!
//! - [`BackgroundProcess`] - The unit of work a process runs
//! - [`ProcessStatus`] - Lifecycle status with its transition table
//! - [`ProcessRecord`] - Persisted state of a process
//! - [`ProcessLifecycle`] - Status changes, start/stop/restart and execution
//! - [`ProcessRegistry`] - Process constructors by kind
//! - [`JsonRecordStore`] - Record persistence in a storage directory

pub mod error;
pub mod lifecycle;
pub mod process;
pub mod record;
pub mod registry;
pub mod status;
pub mod store;

pub use error::{ProcessError, ProcessResult};
pub use lifecycle::{ProcessLifecycle, SaveRecord};
pub use process::{BackgroundProcess, ProcessContext};
pub use record::{ProcessRecord, ScheduleMode};
pub use registry::{ProcessFactory, ProcessRegistry};
pub use status::{InvalidTransition, ProcessStatus};
pub use store::{JsonRecordStore, StorageError, StorageResult};
