//! Error types for lesson-store

use thiserror::Error;

/// Errors that can occur in the key-value persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Value could not be encoded or a stored entry could not be decoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The namespace budget cannot hold the value even after eviction
    #[error(
        "Storage capacity exceeded for key '{key}': entry is {size} bytes, \
         item limit {max_item_bytes}, namespace usage {used}/{max_total_bytes} bytes"
    )]
    Capacity {
        key: String,
        size: usize,
        used: usize,
        max_item_bytes: usize,
        max_total_bytes: usize,
    },

    /// Keys must be non-empty and may not contain the namespace separator
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Content digest is not 64 hex characters
    #[error("Invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Underlying backend failure
    #[error("Backend failure: {0}")]
    Backend(String),

    /// Filesystem failure
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_mentions_key_and_budget() {
        let err = StorageError::Capacity {
            key: "lesson-result:L1".into(),
            size: 900,
            used: 200,
            max_item_bytes: 1024,
            max_total_bytes: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("lesson-result:L1"));
        assert!(msg.contains("200/1000"));
    }

    #[test]
    fn serde_error_converts() {
        let raw = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: StorageError = raw.into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
