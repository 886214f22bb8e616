//! Tests for stream interruptions, resumption and write deduplication.

use async_trait::async_trait;
use docsync_engine::{Client, Connection, Connector, ListenOptions, Query, ServerBody, SyncResult};
use docsync_store::MemoryPersistence;
use docsync_testkit::{
    eventually, fast_config, fields, init_tracing, next_snapshot, random_collection, random_key,
    snapshot_where, MemoryServer, TestDb,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connects to a [`MemoryServer`] but loses the connection, together with
/// the first write acknowledgement on it, once.
struct LossyConnector {
    server: MemoryServer,
    lost: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for LossyConnector {
    async fn connect(&self) -> SyncResult<Connection> {
        let connection = self.server.accept()?;
        if self.lost.load(Ordering::SeqCst) {
            return Ok(connection);
        }
        let Connection {
            outbound,
            mut inbound,
        } = connection;
        let (tx, rx) = mpsc::unbounded_channel();
        let lost = Arc::clone(&self.lost);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if matches!(message.body, ServerBody::WriteAck { .. }) {
                    lost.store(true, Ordering::SeqCst);
                    break;
                }
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
        Ok(Connection {
            outbound,
            inbound: rx,
        })
    }
}

#[tokio::test]
async fn listener_resumes_after_disconnect() {
    init_tracing();
    let db = TestDb::new().await;
    let collection = db.with_test_collection(&[("a", json!({"n": 1}))]).await;

    let mut stream = db
        .listen_with_options(
            Query::at_collection(collection.clone()),
            ListenOptions::new().with_metadata_changes(true),
        )
        .unwrap();
    snapshot_where(&mut stream, |s| s.len() == 1 && !s.from_cache()).await;

    db.server.disconnect_all();
    let b = random_key(&collection);
    db.server.write_direct(&b, fields(json!({"n": 2})));

    let resumed = snapshot_where(&mut stream, |s| s.len() == 2 && !s.from_cache()).await;
    assert!(resumed.document_snapshot(&b).exists());

    drop(stream);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn sequence_gap_forces_full_resync() {
    init_tracing();
    let db = TestDb::new().await;
    let collection = db.with_test_collection(&[("a", json!({"n": 1}))]).await;

    let mut stream = db
        .listen_with_options(
            Query::at_collection(collection.clone()),
            ListenOptions::new().with_metadata_changes(true),
        )
        .unwrap();
    snapshot_where(&mut stream, |s| s.len() == 1 && !s.from_cache()).await;

    // The change arrives with a skipped sequence number and is discarded.
    db.server.inject_sequence_gap();
    let b = random_key(&collection);
    db.server.write_direct(&b, fields(json!({"n": 2})));

    let resynced = snapshot_where(&mut stream, |s| s.len() == 2 && !s.from_cache()).await;
    assert_eq!(
        resynced.document_snapshot(&b).data(),
        Some(&fields(json!({"n": 2})))
    );

    drop(stream);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn resent_write_is_applied_once() {
    init_tracing();
    let server = MemoryServer::new();
    let lost = Arc::new(AtomicBool::new(false));
    let connector = LossyConnector {
        server: server.clone(),
        lost: Arc::clone(&lost),
    };
    let client = Client::open(
        fast_config(),
        Arc::new(MemoryPersistence::new()),
        Arc::new(connector),
    )
    .await
    .unwrap();
    let key = random_key(&random_collection());

    let version = client
        .set(&key, fields(json!({"once": true})))
        .await
        .unwrap()
        .committed()
        .await
        .unwrap();

    assert!(lost.load(Ordering::SeqCst));
    assert_eq!(server.writes_received(), 2);
    assert_eq!(server.write_count(), 1);
    assert_eq!(server.version(), version);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn other_clients_see_changes_after_reconnect() {
    let server = MemoryServer::new();
    let writer = TestDb::on(&server).await;
    let reader = TestDb::on(&server).await;
    let key = random_key(&random_collection());

    let mut stream = reader.listen(Query::document(&key)).unwrap();
    assert!(next_snapshot(&mut stream).await.is_empty());
    eventually(|| server.connection_count() >= 1).await;

    server.disconnect_all();
    writer
        .set(&key, fields(json!({"v": 1})))
        .await
        .unwrap()
        .committed()
        .await
        .unwrap();

    let seen = snapshot_where(&mut stream, |s| !s.is_empty()).await;
    assert_eq!(
        seen.document_snapshot(&key).data(),
        Some(&fields(json!({"v": 1})))
    );

    drop(stream);
    writer.shutdown().await.unwrap();
    reader.shutdown().await.unwrap();
}
