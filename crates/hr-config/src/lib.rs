//! Runtime configuration
//!
//! Loads `runtime.yaml` with two custom tags and turns it into a validated
//! [`RuntimeConfig`]:
//!
//! - `!include path` - Include another YAML file
//! - `!include_dir_merge_list dir` - Merge the lists of every YAML file in a directory
//! - `!env_var VAR` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use hr_config::{RuntimeConfig, DEFAULT_CONFIG_FILE};
//!
//! let config = RuntimeConfig::load("/etc/homerun", DEFAULT_CONFIG_FILE)?;
//! println!("tick every {:?}", config.scheduler.tick());
//! ```

mod error;
mod loader;
mod runtime;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, YamlLoader};
pub use runtime::{
    LocksConfig, LoggingConfig, ProcessConfig, RuntimeConfig, ScheduleModeConfig,
    SchedulerSection, StorageConfig, DEFAULT_CONFIG_FILE,
};
