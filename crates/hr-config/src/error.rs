//! Error types for configuration loading

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading the runtime configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid include path '{path}': {reason}")]
    InvalidIncludePath { path: String, reason: String },

    #[error("directory not found: {path}")]
    DirectoryNotFound { path: PathBuf },

    #[error("circular include detected: {path}")]
    CircularInclude { path: PathBuf },

    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    /// A tag or field has the wrong shape
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// The document parsed but breaks a runtime rule
    #[error("configuration validation failed: {message}")]
    ValidationFailed { message: String },
}
