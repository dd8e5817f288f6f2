//! YAML loader with custom tags
//!
//! - `!include path` - Replace the node with another YAML file
//! - `!include_dir_merge_list dir` - Concatenate the lists of every YAML file in a directory
//! - `!env_var NAME` - Replace the node with an environment variable

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use tracing::{debug, trace};

use crate::error::{ConfigError, ConfigResult};

/// Loads YAML documents relative to a config directory
#[derive(Debug)]
pub struct YamlLoader {
    config_dir: PathBuf,
    /// Files currently being loaded, for cycle detection
    include_stack: HashSet<PathBuf>,
}

impl YamlLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            include_stack: HashSet::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load a file and resolve every tag in it
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve_path(path.as_ref());
        debug!(path = %path.display(), "Loading YAML file");

        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::ReadFile {
            path: path.clone(),
            source: e,
        })?;

        self.include_stack.insert(path.clone());
        let result = self.load_string(&content, &path);
        self.include_stack.remove(&path);

        result
    }

    /// Parse a YAML string; relative includes resolve against `source_path`'s directory
    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;

        self.process_value(value, source_path)
    }

    fn process_value(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut result = Mapping::with_capacity(map.len());
                for (k, v) in map {
                    result.insert(k, self.process_value(v, source_path)?);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.process_value(v, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn process_tagged(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Processing tag");

        match tag.as_str() {
            "!include" => {
                let path = self.value_to_path(&tagged.value, source_path)?;
                self.load_file(path)
            }
            "!include_dir_merge_list" => {
                let dir = self.value_to_path(&tagged.value, source_path)?;
                let mut merged = Vec::new();
                for file in yaml_files(&dir)? {
                    match self.load_file(&file)? {
                        Value::Sequence(seq) => merged.extend(seq),
                        Value::Null => {}
                        other => merged.push(other),
                    }
                }
                Ok(Value::Sequence(merged))
            }
            "!env_var" => {
                let name = tagged.value.as_str().ok_or_else(|| ConfigError::InvalidValue {
                    key: "!env_var".to_string(),
                    reason: "environment variable name must be a string".to_string(),
                })?;
                let value = std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound {
                    var: name.to_string(),
                })?;
                debug!(var = name, "Substituted env var");
                // Numbers and booleans keep their type; anything else stays a string
                Ok(match serde_yaml::from_str::<Value>(&value) {
                    Ok(scalar @ (Value::Bool(_) | Value::Number(_))) => scalar,
                    _ => Value::String(value),
                })
            }
            _ => Err(ConfigError::InvalidValue {
                key: tag,
                reason: "unknown tag".to_string(),
            }),
        }
    }

    fn value_to_path(&self, value: &Value, source_path: &Path) -> ConfigResult<PathBuf> {
        let path = value.as_str().ok_or_else(|| ConfigError::InvalidIncludePath {
            path: format!("{:?}", value),
            reason: "path must be a string".to_string(),
        })?;

        let path = Path::new(path);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let base = source_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(&self.config_dir);
        Ok(base.join(path))
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }
}

/// YAML files of a directory, sorted by name
fn yaml_files(dir: &Path) -> ConfigResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(ConfigError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| ConfigError::ReadFile {
            path: dir.to_path_buf(),
            source: e,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false)
        })
        .collect();

    files.sort();
    Ok(files)
}

/// Load a YAML file from `config_dir` with tag processing
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir).load_file(file)
}
