//! Durable key-value storage for the last batch input.
//!
//! The controller only ever writes one record: the serialized params of the
//! most recent attempt, under the configured state key. Writes are
//! best-effort; reads happen on `resume`.

pub mod file;

pub use file::FileStore;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::StoreResult;

/// Key-value persistence used by the controller.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the value under `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store `value` under `key`. `ttl = None` keeps it indefinitely.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at.is_some_and(|at| Instant::now() >= at),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }

        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let entry = MemoryEntry {
            value: value.to_string(),
            // A lifetime past what `Instant` can represent never expires.
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
        Ok(())
    }
}
