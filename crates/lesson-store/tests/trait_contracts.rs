//! Contract tests run against every `KvBackend` implementation.

use std::sync::Arc;

use lesson_store::{FileKvBackend, KvBackend, MemoryKvBackend, NamespacedStore, StoreLimits};
use serde_json::json;

async fn exercise_backend(backend: Arc<dyn KvBackend>) {
    assert!(backend.read("missing").await.unwrap().is_none());

    backend.write("ns:a", "1".into()).await.unwrap();
    backend.write("ns:b", "2".into()).await.unwrap();
    backend.write("other:a", "3".into()).await.unwrap();

    let mut keys = backend.keys("ns:").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["ns:a".to_string(), "ns:b".to_string()]);

    backend.write("ns:a", "10".into()).await.unwrap();
    assert_eq!(backend.read("ns:a").await.unwrap().as_deref(), Some("10"));

    backend.delete("ns:a").await.unwrap();
    backend.delete("ns:a").await.unwrap();
    assert!(backend.read("ns:a").await.unwrap().is_none());
}

#[tokio::test]
async fn memory_backend_contract() {
    exercise_backend(Arc::new(MemoryKvBackend::new())).await;
}

#[tokio::test]
async fn file_backend_contract() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileKvBackend::open(dir.path().join("kv.json")).await.unwrap();
    exercise_backend(Arc::new(backend)).await;
}

#[tokio::test]
async fn lesson_summary_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.json");

    {
        let backend: Arc<dyn KvBackend> = Arc::new(FileKvBackend::open(&path).await.unwrap());
        let store = NamespacedStore::for_user(backend, "learner-7", StoreLimits::default());
        store
            .set("lesson-result:L1", &json!({"totalScore": 0.625, "passed": false}))
            .await
            .unwrap();
    }

    let backend: Arc<dyn KvBackend> = Arc::new(FileKvBackend::open(&path).await.unwrap());
    let store = NamespacedStore::for_user(backend, "learner-7", StoreLimits::default());
    let summary: serde_json::Value = store.get("lesson-result:L1").await.unwrap().unwrap();
    assert_eq!(summary["totalScore"], json!(0.625));
    assert_eq!(store.namespace(), "user:learner-7");
}
