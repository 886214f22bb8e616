//! Tests for working without a server connection.

use docsync_engine::{ListenOptions, Query, Source, StreamState, SyncError};
use docsync_testkit::{
    eventually, fields, init_tracing, next_snapshot, random_collection, random_key,
    snapshot_where, TestDb,
};
use serde_json::json;

#[tokio::test]
async fn writes_apply_locally_while_offline() {
    init_tracing();
    let db = TestDb::new().await;
    db.server.set_offline(true);
    let key = random_key(&random_collection());

    let pending = db.set(&key, fields(json!({"draft": true}))).await.unwrap();

    let snapshot = db.get(&key, Source::Default).await.unwrap();
    assert!(snapshot.exists());
    assert!(snapshot.from_cache());
    assert!(snapshot.has_pending_writes());
    assert_eq!(snapshot.data(), Some(&fields(json!({"draft": true}))));
    assert_eq!(db.server.write_count(), 0);

    let states = db.stream_states();
    eventually(|| *states.borrow() == StreamState::Backoff).await;

    db.server.set_offline(false);
    let version = pending.committed().await.unwrap();
    assert_eq!(db.server.version(), version);
    assert!(db.server.document(&key).is_some());

    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn server_reads_fail_while_offline() {
    let db = TestDb::new().await;
    db.server.set_offline(true);
    let key = random_key(&random_collection());

    let err = db.get(&key, Source::Server).await.unwrap_err();
    assert!(
        matches!(err, SyncError::NetworkUnavailable | SyncError::Timeout),
        "unexpected error: {err}"
    );
    assert!(err.is_retryable());
    assert!(!err.is_fatal());

    // The cache still answers.
    let cached = db.get(&key, Source::Cache).await.unwrap();
    assert!(!cached.exists());

    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn listener_goes_in_sync_after_reconnect() {
    init_tracing();
    let db = TestDb::new().await;
    let collection = db.with_test_collection(&[("a", json!({"n": 1}))]).await;
    db.server.set_offline(true);

    let mut stream = db
        .listen_with_options(
            Query::at_collection(collection.clone()),
            ListenOptions::new().with_metadata_changes(true),
        )
        .unwrap();
    let cached = next_snapshot(&mut stream).await;
    assert_eq!(cached.len(), 1);
    assert!(cached.from_cache());

    let key = random_key(&collection);
    db.set(&key, fields(json!({"n": 2}))).await.unwrap();
    let local = next_snapshot(&mut stream).await;
    assert_eq!(local.len(), 2);
    assert!(local.has_pending_writes());
    assert!(local.from_cache());

    db.server.set_offline(false);
    let synced = snapshot_where(&mut stream, |s| !s.from_cache() && !s.has_pending_writes()).await;
    assert_eq!(synced.len(), 2);
    assert!(synced.changes().is_empty());
    assert!(synced.metadata_changed());

    drop(stream);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_keeps_unsent_writes_queued() {
    let db = TestDb::new().await;
    db.server.set_offline(true);
    let key = random_key(&random_collection());

    let pending = db.set(&key, fields(json!({"a": 1}))).await.unwrap();
    db.shutdown().await.unwrap();

    assert!(matches!(
        pending.committed().await,
        Err(SyncError::ClientShutdown)
    ));
    assert_eq!(db.server.write_count(), 0);
}
