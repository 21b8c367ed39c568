//! Storage trait definitions for the lesson runtime
//!
//! - `KvBackend`: flat string key-value persistence (memory, file, …)
//! - `StoredEntry`: the envelope written for every namespaced value
//! - `ContentDigest`: SHA-256 digest used to verify fetched bundles
//!
//! Backends are async and know nothing about namespaces or budgets; those
//! rules live in [`crate::NamespacedStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// KvBackend
// ---------------------------------------------------------------------------

/// Flat key-value backend.
///
/// Guarantees:
/// - `write(k, v)` followed by `read(k)` returns `Some(v)`.
/// - `delete` of an absent key is a no-op.
/// - `keys(prefix)` returns every stored key starting with `prefix`.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read the raw value for a key.
    async fn read(&self, key: &str) -> StorageResult<Option<String>>;

    /// Insert or overwrite a key.
    async fn write(&self, key: &str, value: String) -> StorageResult<()>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List keys with the given prefix.
    async fn keys(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// StoredEntry
// ---------------------------------------------------------------------------

/// Envelope persisted for every namespaced value.
///
/// `touched` is a logical timestamp refreshed on every read and write; the
/// LRU eviction pass orders entries by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: serde_json::Value,
    pub touched: u64,
}

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
