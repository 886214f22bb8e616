//! Local store durability over the file-backed commit log.

use docsync_model::{BatchId, Document, DocumentKey, Fields, Mutation, SnapshotVersion, Value};
use docsync_store::{
    FilePersistence, FilePersistenceConfig, LocalStore, Persistence, PersistenceError,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use tempfile::tempdir;

fn key(path: &str) -> DocumentKey {
    DocumentKey::parse(path).unwrap()
}

fn fields(text: &str) -> Fields {
    let mut f = Fields::new();
    f.insert("text".into(), Value::from(text));
    f
}

fn open(dir: &std::path::Path) -> LocalStore {
    let persistence: Arc<dyn Persistence> =
        Arc::new(FilePersistence::open(dir, FilePersistenceConfig::new()).unwrap());
    LocalStore::open(persistence).unwrap()
}

#[test]
fn pending_batches_survive_restart() {
    let dir = tempdir().unwrap();
    let client_id = {
        let mut store = open(dir.path());
        store
            .enqueue_batch(vec![Mutation::set(key("rooms/eros"), fields("hi"))])
            .unwrap();
        store
            .enqueue_batch(vec![Mutation::delete(key("rooms/old"))])
            .unwrap();
        store.client_id()
    };

    let store = open(dir.path());
    assert_eq!(store.client_id(), client_id);
    let ids: Vec<_> = store.queue().all_batches().map(|b| b.batch_id).collect();
    assert_eq!(ids, vec![BatchId::new(1), BatchId::new(2)]);
    let doc = store.local_document(&key("rooms/eros")).unwrap();
    assert_eq!(doc.fields, fields("hi"));
    assert!(doc.has_local_mutations);
}

#[test]
fn acknowledged_state_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let mut store = open(dir.path());
        let batch = store
            .enqueue_batch(vec![Mutation::set(key("rooms/eros"), fields("hi"))])
            .unwrap();
        store
            .acknowledge_batch(batch.batch_id, SnapshotVersion::new(3))
            .unwrap();
        store
            .apply_remote_documents(
                vec![Document::found(
                    key("rooms/other"),
                    SnapshotVersion::new(4),
                    fields("x"),
                )],
                SnapshotVersion::new(4),
            )
            .unwrap();
    }

    let mut store = open(dir.path());
    assert!(store.queue().is_empty());
    assert_eq!(store.checkpoint(), SnapshotVersion::new(4));
    let doc = store.remote_document(&key("rooms/eros")).unwrap();
    assert_eq!(doc.version, SnapshotVersion::new(3));

    let next = store
        .enqueue_batch(vec![Mutation::delete(key("rooms/eros"))])
        .unwrap();
    assert_eq!(next.batch_id, BatchId::new(2));
}

#[test]
fn torn_commit_is_discarded() {
    let dir = tempdir().unwrap();
    {
        let mut store = open(dir.path());
        store
            .enqueue_batch(vec![Mutation::set(key("rooms/eros"), fields("hi"))])
            .unwrap();
    }
    {
        let mut log = OpenOptions::new()
            .append(true)
            .open(dir.path().join("commits.log"))
            .unwrap();
        log.write_all(b"DSLG\x01\x00\xff\x00\x00\x00partial").unwrap();
    }

    let store = open(dir.path());
    assert_eq!(store.queue().len(), 1);
}

#[test]
fn concurrent_open_is_refused() {
    let dir = tempdir().unwrap();
    let _held = FilePersistence::open(dir.path(), FilePersistenceConfig::new()).unwrap();
    let err = FilePersistence::open(dir.path(), FilePersistenceConfig::new()).unwrap_err();
    assert!(matches!(err, PersistenceError::Locked(_)));
}
