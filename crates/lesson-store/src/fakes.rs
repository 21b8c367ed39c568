//! In-memory backend
//!
//! `MemoryKvBackend` satisfies the [`KvBackend`] contract without touching
//! the filesystem. Used by tests and by hosts that do not need results to
//! survive the process.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory key-value backend backed by a `BTreeMap<key, value>`.
#[derive(Debug, Default)]
pub struct MemoryKvBackend {
    store: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw keys across all namespaces.
    pub fn len(&self) -> usize {
        self.store.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.store
            .lock()
            .map_err(|_| StorageError::Backend("memory backend lock poisoned".into()))
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    async fn read(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn write(&self, key: &str, value: String) -> StorageResult<()> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
