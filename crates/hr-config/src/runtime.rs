//! Runtime configuration
//!
//! The typed form of `runtime.yaml`. Every section is optional and falls back
//! to its defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;

/// Default file name looked up in the config directory
pub const DEFAULT_CONFIG_FILE: &str = "runtime.yaml";

fn default_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_min_period_ms() -> u64 {
    1000
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".storage")
}

fn default_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// `logging` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// `locks` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub poll_interval_ms: u64,
    pub event_capacity: usize,
}

impl LocksConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// `scheduler` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_ms: u64,
    pub min_period_ms: u64,
}

impl SchedulerSection {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn min_period(&self) -> Duration {
        Duration::from_millis(self.min_period_ms)
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            min_period_ms: default_min_period_ms(),
        }
    }
}

/// `storage` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of persisted process records; relative to the config directory
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

/// How a periodic process schedules its next run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleModeConfig {
    #[default]
    FixedDelay,
    FixedRate,
}

/// One entry of the `processes` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub id: String,
    /// Registry tag of the process implementation
    pub kind: String,
    /// 0 runs once per start
    #[serde(default)]
    pub period_ms: u64,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub schedule_mode: ScheduleModeConfig,
    /// Passed to the process constructor as-is
    #[serde(default = "default_params")]
    pub params: serde_json::Value,
}

impl ProcessConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// The whole runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub logging: LoggingConfig,
    pub locks: LocksConfig,
    pub scheduler: SchedulerSection,
    pub storage: StorageConfig,
    pub processes: Vec<ProcessConfig>,
}

impl RuntimeConfig {
    /// Load `file` from `config_dir`, resolve tags and validate
    ///
    /// A relative storage directory is made relative to `config_dir`.
    pub fn load(config_dir: impl AsRef<Path>, file: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        let mut loader = YamlLoader::new(config_dir);
        let value = loader.load_file(file.as_ref())?;

        let mut config = Self::from_value(value, &config_dir.join(file.as_ref()))?;
        if config.storage.dir.is_relative() {
            config.storage.dir = config_dir.join(&config.storage.dir);
        }

        info!(
            processes = config.processes.len(),
            storage = %config.storage.dir.display(),
            "Loaded runtime configuration"
        );
        Ok(config)
    }

    /// Parse a YAML string without tag resolution against the filesystem
    pub fn from_yaml(content: &str) -> ConfigResult<Self> {
        let source = Path::new(DEFAULT_CONFIG_FILE);
        let value = YamlLoader::new(".").load_string(content, source)?;
        Self::from_value(value, source)
    }

    fn from_value(value: serde_yaml::Value, source: &Path) -> ConfigResult<Self> {
        // An empty document is the all-defaults configuration
        let config: Self = if value.is_null() {
            Self::default()
        } else {
            serde_yaml::from_value(value).map_err(|e| ConfigError::ParseYaml {
                path: source.to_path_buf(),
                source: e,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the rules serde cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if self.locks.poll_interval_ms == 0 {
            return Err(invalid("locks.poll_interval_ms must be greater than 0"));
        }
        if self.locks.event_capacity == 0 {
            return Err(invalid("locks.event_capacity must be greater than 0"));
        }
        if self.scheduler.tick_ms == 0 {
            return Err(invalid("scheduler.tick_ms must be greater than 0"));
        }
        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(invalid(format!("unknown logging.level '{}'", self.logging.level)));
        }

        let mut seen = HashSet::new();
        for process in &self.processes {
            let id = process.id.as_str();
            if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
                return Err(invalid(format!("invalid process id '{}'", id)));
            }
            if !seen.insert(id) {
                return Err(invalid(format!("duplicate process id '{}'", id)));
            }
            if process.kind.is_empty() {
                return Err(invalid(format!("process '{}' has no kind", id)));
            }
            if process.period_ms != 0 && process.period_ms < self.scheduler.min_period_ms {
                return Err(invalid(format!(
                    "process '{}' period_ms {} is below scheduler.min_period_ms {}",
                    id, process.period_ms, self.scheduler.min_period_ms
                )));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationFailed {
        message: message.into(),
    }
}
