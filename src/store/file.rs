//! File-backed state store.
//!
//! Each key maps to one JSON record inside the store directory. Records are
//! written atomically (temp file + rename) so an interrupted write never
//! leaves a half-written record behind.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::StateStore;
use crate::error::StoreResult;

/// Default name for the state directory.
pub const STATE_DIR_NAME: &str = ".batchloop";

/// On-disk record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredRecord {
    value: String,
    written_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Store that keeps one JSON file per key.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `base_dir/.batchloop`, creating the directory
    /// if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(base_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::at(base_dir.into().join(STATE_DIR_NAME))
    }

    /// Create a store that writes directly into `dir`.
    pub fn at(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `key`.
    ///
    /// Anything outside `[A-Za-z0-9_-]` is replaced with `_`.
    pub fn record_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let path = self.record_path(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: StoredRecord = serde_json::from_str(&content)?;
        if record.is_expired(Utc::now()) {
            debug!(path = %path.display(), "stored record expired");
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Utc::now();
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        let record = StoredRecord {
            value: value.to_string(),
            written_at: now,
            expires_at,
        };
        let json = serde_json::to_string_pretty(&record)?;
        let path = self.record_path(key);

        tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    // Temp file in the same directory so the rename stays on one filesystem.
    let temp_path = path.with_extension("json.tmp");

    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;

    std::fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use tempfile::TempDir;

    #[test]
    fn test_new_creates_state_directory() {
        let temp_dir = TempDir::new().unwrap();

        let store = FileStore::new(temp_dir.path()).unwrap();

        let state_dir = temp_dir.path().join(".batchloop");
        assert!(state_dir.is_dir());
        assert_eq!(store.dir(), state_dir.as_path());
    }

    #[test]
    fn test_record_path_sanitises_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::at(temp_dir.path()).unwrap();

        assert_eq!(
            store.record_path("../etc/passwd"),
            temp_dir.path().join("___etc_passwd.json")
        );
        assert_eq!(
            store.record_path("batch_last_params"),
            temp_dir.path().join("batch_last_params.json")
        );
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::at(temp_dir.path()).unwrap();

        assert_eq!(store.get("batch_last_params").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::at(temp_dir.path()).unwrap();

        store
            .set("batch_last_params", "{\"page\":3}", None)
            .await
            .unwrap();

        assert_eq!(
            store.get("batch_last_params").await.unwrap().as_deref(),
            Some("{\"page\":3}")
        );
    }

    #[tokio::test]
    async fn test_set_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::at(temp_dir.path()).unwrap();

        store.set("k", "v", None).await.unwrap();

        let temp_path = store.record_path("k").with_extension("json.tmp");
        assert!(!temp_path.exists());
        assert!(store.record_path("k").exists());
    }

    #[tokio::test]
    async fn test_values_survive_a_new_store_instance() {
        let temp_dir = TempDir::new().unwrap();
        FileStore::at(temp_dir.path())
            .unwrap()
            .set("k", "persisted", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let reopened = FileStore::at(temp_dir.path()).unwrap();
        assert_eq!(
            reopened.get("k").await.unwrap().as_deref(),
            Some("persisted")
        );
    }

    #[tokio::test]
    async fn test_expired_record_reads_as_absent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::at(temp_dir.path()).unwrap();

        store.set("k", "stale", Some(Duration::ZERO)).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_json_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::at(temp_dir.path()).unwrap();

        std::fs::write(store.record_path("k"), "{ invalid json }").unwrap();

        let result = store.get("k").await;
        assert!(matches!(result, Err(StoreError::Json(_))));
    }
}
