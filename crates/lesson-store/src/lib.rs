//! Lesson-Store: key-value persistence for the lesson runtime
//!
//! Activities and the orchestrator persist small JSON documents (progress,
//! lesson summaries) through a [`NamespacedStore`]. Each store instance is
//! confined to its own key prefix and its own size budget; when the budget is
//! exhausted the least-recently-used quarter of the namespace is evicted
//! before a write is refused.
//!
//! ## Key Components
//!
//! - `KvBackend`: flat async key-value backend trait
//! - `MemoryKvBackend` / `FileKvBackend`: in-process and on-disk backends
//! - `NamespacedStore`: prefixing, budgets, LRU eviction

mod error;
pub mod fakes;
mod file_backend;
mod namespaced;
pub mod storage_traits;

pub use error::StorageError;
pub use fakes::MemoryKvBackend;
pub use file_backend::FileKvBackend;
pub use namespaced::{NamespacedStore, StoreLimits, NAMESPACE_SEPARATOR};
pub use storage_traits::{ContentDigest, KvBackend, StorageResult, StoredEntry};
