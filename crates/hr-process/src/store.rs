//! JSON record store
//!
//! Persists each [`ProcessRecord`] as `<dir>/<id>.json`, wrapped with a
//! version header:
//!
//! ```json
//! {
//!   "version": 1,
//!   "key": "heartbeat",
//!   "data": { ... }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::lifecycle::SaveRecord;
use crate::record::ProcessRecord;

/// Current record file version
pub const STORAGE_VERSION: u32 = 1;

const EXTENSION: &str = "json";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage file wrapper with version tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub key: String,
    pub data: T,
}

/// Directory of process records
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    dir: PathBuf,
}

impl JsonRecordStore {
    /// Create a store rooted at `dir`; the directory is created on first save
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a process id
    pub fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, EXTENSION))
    }

    /// Save a record
    ///
    /// Synchronous so it can back the lifecycle save callback. Writes to a
    /// temp file first, then renames.
    pub fn save(&self, record: &ProcessRecord) -> StorageResult<()> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.file_path(&record.id);
        let temp_path = self.dir.join(format!("{}.{}.tmp", record.id, EXTENSION));

        let file = StorageFile {
            version: STORAGE_VERSION,
            key: record.id.clone(),
            data: record,
        };
        let content = serde_json::to_string_pretty(&file)?;

        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &path)?;

        debug!(process_id = %record.id, status = %record.status, "Saved process record");
        Ok(())
    }

    /// Load the record of one process; `None` if it was never saved
    pub async fn load(&self, id: &str) -> StorageResult<Option<ProcessRecord>> {
        let path = self.file_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).await.map(Some)
    }

    async fn read(path: &Path) -> StorageResult<ProcessRecord> {
        let content = fs::read_to_string(path).await?;
        let file: StorageFile<ProcessRecord> = serde_json::from_str(&content)?;

        if file.version != STORAGE_VERSION {
            return Err(StorageError::VersionMismatch {
                key: file.key,
                expected: STORAGE_VERSION,
                found: file.version,
            });
        }
        Ok(file.data)
    }

    /// Load every saved record, sorted by id
    ///
    /// Unreadable files are logged and skipped so one corrupt record does not
    /// block startup.
    pub async fn load_all(&self) -> StorageResult<Vec<ProcessRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }

            match Self::read(&path).await {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable process record"),
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(count = records.len(), dir = ?self.dir, "Loaded process records");
        Ok(records)
    }

    /// Delete the record of one process
    pub async fn delete(&self, id: &str) -> StorageResult<()> {
        let path = self.file_path(id);
        if path.exists() {
            fs::remove_file(&path).await?;
            debug!(process_id = id, "Deleted process record");
        }
        Ok(())
    }

    /// Save callback writing through this store
    pub fn save_record(&self) -> SaveRecord {
        let store = self.clone();
        Arc::new(move |record: &ProcessRecord| -> Result<(), String> {
            store.save(record).map_err(|e| e.to_string())
        })
    }
}
