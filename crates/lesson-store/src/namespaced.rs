//! Namespaced, size-bounded store with LRU eviction.
//!
//! Every key is written as `<namespace>:<key>`, so a store instance can only
//! ever see its own entries. Sizes are measured on the serialized
//! [`StoredEntry`] envelope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{KvBackend, StorageResult, StoredEntry};

/// Separator between namespace and key.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Size budget for one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLimits {
    /// Largest serialized entry accepted by `set`.
    pub max_item_bytes: usize,
    /// Total serialized bytes the namespace may hold.
    pub max_total_bytes: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_item_bytes: 64 * 1024,
            max_total_bytes: 4 * 1024 * 1024,
        }
    }
}

/// A namespaced view over a shared [`KvBackend`].
pub struct NamespacedStore {
    backend: Arc<dyn KvBackend>,
    namespace: String,
    limits: StoreLimits,
    clock: AtomicU64,
}

impl std::fmt::Debug for NamespacedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedStore")
            .field("namespace", &self.namespace)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl NamespacedStore {
    pub fn new(backend: Arc<dyn KvBackend>, namespace: impl Into<String>, limits: StoreLimits) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            limits,
            clock: AtomicU64::new(0),
        }
    }

    /// Namespace scoped to one user (`user:<id>`).
    pub fn for_user(backend: Arc<dyn KvBackend>, user_id: &str, limits: StoreLimits) -> Self {
        Self::new(backend, format!("user{NAMESPACE_SEPARATOR}{user_id}"), limits)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Read and decode a value, refreshing its recency.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let full = self.full_key(key)?;
        let Some(raw) = self.backend.read(&full).await? else {
            return Ok(None);
        };
        let mut entry: StoredEntry = serde_json::from_str(&raw)?;
        let decoded = serde_json::from_value(entry.value.clone())?;

        entry.touched = self.tick();
        self.backend.write(&full, serde_json::to_string(&entry)?).await?;
        Ok(Some(decoded))
    }

    /// Encode and store a value.
    ///
    /// When the entry does not fit, the least-recently-used quarter of the
    /// namespace is evicted and the write retried once; a second miss is a
    /// [`StorageError::Capacity`].
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let full = self.full_key(key)?;
        let entry = StoredEntry {
            value: serde_json::to_value(value)?,
            touched: self.tick(),
        };
        let encoded = serde_json::to_string(&entry)?;
        let size = encoded.len();

        let mut used = self.usage_excluding(&full).await?;
        if !self.fits(size, used) {
            let evicted = self.evict_lru().await?;
            debug!(namespace = %self.namespace, key, evicted, "evicted entries to make room");
            used = self.usage_excluding(&full).await?;
            if !self.fits(size, used) {
                warn!(namespace = %self.namespace, key, size, used, "storage capacity exceeded");
                return Err(StorageError::Capacity {
                    key: key.to_string(),
                    size,
                    used,
                    max_item_bytes: self.limits.max_item_bytes,
                    max_total_bytes: self.limits.max_total_bytes,
                });
            }
        }

        self.backend.write(&full, encoded).await
    }

    pub async fn remove(&self, key: &str) -> StorageResult<()> {
        let full = self.full_key(key)?;
        self.backend.delete(&full).await
    }

    /// Keys in this namespace, without the prefix.
    pub async fn keys(&self) -> StorageResult<Vec<String>> {
        let prefix = self.prefix();
        Ok(self
            .backend
            .keys(&prefix)
            .await?
            .into_iter()
            .map(|k| k[prefix.len()..].to_string())
            .collect())
    }

    /// Total serialized bytes held by this namespace.
    pub async fn usage_bytes(&self) -> StorageResult<usize> {
        self.usage_excluding("").await
    }

    /// Drop every entry in this namespace.
    pub async fn clear(&self) -> StorageResult<()> {
        for key in self.backend.keys(&self.prefix()).await? {
            self.backend.delete(&key).await?;
        }
        Ok(())
    }

    /// Evict the least-recently-used ~25% (at least one) of this namespace.
    ///
    /// Returns the number of entries removed. Entries that fail to decode
    /// sort first, so corrupt data is the first to go.
    pub async fn evict_lru(&self) -> StorageResult<usize> {
        let mut stamped = Vec::new();
        for key in self.backend.keys(&self.prefix()).await? {
            let touched = match self.backend.read(&key).await? {
                Some(raw) => serde_json::from_str::<StoredEntry>(&raw)
                    .map(|e| e.touched)
                    .unwrap_or(0),
                None => continue,
            };
            stamped.push((touched, key));
        }
        if stamped.is_empty() {
            return Ok(0);
        }
        stamped.sort();
        let count = stamped.len().div_ceil(4).max(1);
        for (_, key) in stamped.iter().take(count) {
            self.backend.delete(key).await?;
        }
        Ok(count)
    }

    fn fits(&self, size: usize, used: usize) -> bool {
        size <= self.limits.max_item_bytes && used + size <= self.limits.max_total_bytes
    }

    async fn usage_excluding(&self, full_key: &str) -> StorageResult<usize> {
        let mut total = 0;
        for key in self.backend.keys(&self.prefix()).await? {
            if key == full_key {
                continue;
            }
            if let Some(raw) = self.backend.read(&key).await? {
                total += raw.len();
            }
        }
        Ok(total)
    }

    fn prefix(&self) -> String {
        format!("{}{NAMESPACE_SEPARATOR}", self.namespace)
    }

    fn full_key(&self, key: &str) -> StorageResult<String> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("key must not be empty".into()));
        }
        Ok(format!("{}{key}", self.prefix()))
    }

    /// Strictly increasing logical timestamp, seeded from wall-clock micros so
    /// ordering survives a restart.
    fn tick(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut current = self.clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(current + 1);
            match self
                .clock
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}
