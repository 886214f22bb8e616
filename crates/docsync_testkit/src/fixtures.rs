//! Test fixtures and client helpers.
//!
//! Provides clients wired to a [`MemoryServer`] with fast retry settings,
//! random collection names so tests never share data, and helpers to seed
//! documents.

use crate::connector::MemoryConnector;
use crate::server::MemoryServer;
use docsync_engine::{BackoffConfig, Client, ClientConfig, SnapshotStream, ViewSnapshot};
use docsync_model::{DocumentKey, Fields, Mutation, ResourcePath, Value};
use docsync_store::{MemoryPersistence, Persistence};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Client configuration tuned for tests: short backoff without jitter and
/// short timeouts.
pub fn fast_config() -> ClientConfig {
    ClientConfig::new()
        .with_backoff(
            BackoffConfig::new()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(100))
                .with_multiplier(2.0)
                .with_jitter(0.0),
        )
        .with_get_timeout(Duration::from_secs(2))
        .with_shutdown_flush_timeout(Duration::from_millis(500))
}

/// Installs a test-friendly `tracing` subscriber. Filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A random identifier suitable for a path segment.
pub fn random_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A fresh top-level collection path no other test uses.
pub fn random_collection() -> ResourcePath {
    ResourcePath::from_segments([format!("test-{}", random_id())])
        .expect("generated collection path is valid")
}

/// A fresh document key in `collection`.
pub fn random_key(collection: &ResourcePath) -> DocumentKey {
    DocumentKey::new_in(collection, &random_id()).expect("generated document key is valid")
}

/// Converts a JSON object into document fields.
///
/// # Panics
///
/// Panics if `json` is not an object.
pub fn fields(json: serde_json::Value) -> Fields {
    match Value::from(json) {
        Value::Map(fields) => fields,
        other => panic!("expected a JSON object, got {other:?}"),
    }
}

/// Opens a client on `server` with `persistence`.
pub async fn open_client(server: &MemoryServer, persistence: Arc<dyn Persistence>) -> Client {
    Client::open(
        fast_config(),
        persistence,
        Arc::new(MemoryConnector::new(server)),
    )
    .await
    .expect("failed to open client")
}

/// A client on a [`MemoryServer`] with in-memory persistence.
pub struct TestDb {
    /// The client.
    pub client: Client,
    /// The server the client talks to.
    pub server: MemoryServer,
    /// The client's storage, for fault injection.
    pub persistence: Arc<MemoryPersistence>,
}

impl TestDb {
    /// Creates a client on a new, private server.
    pub async fn new() -> Self {
        Self::on(&MemoryServer::new()).await
    }

    /// Creates a client on `server`.
    pub async fn on(server: &MemoryServer) -> Self {
        let persistence = Arc::new(MemoryPersistence::new());
        let client = open_client(server, persistence.clone()).await;
        Self {
            client,
            server: server.clone(),
            persistence,
        }
    }

    /// Writes one document in a fresh collection and waits for the server
    /// to commit it.
    pub async fn with_test_doc(&self, json: serde_json::Value) -> DocumentKey {
        let key = random_key(&random_collection());
        self.client
            .set(&key, fields(json))
            .await
            .expect("local write failed")
            .committed()
            .await
            .expect("server rejected test document");
        key
    }

    /// Writes `docs` (id, contents) into a fresh collection in one batch and
    /// waits for the server to commit them.
    pub async fn with_test_collection(
        &self,
        docs: &[(&str, serde_json::Value)],
    ) -> ResourcePath {
        let collection = random_collection();
        if docs.is_empty() {
            return collection;
        }
        let mutations = docs
            .iter()
            .map(|(id, json)| {
                let key = DocumentKey::new_in(&collection, id).expect("valid document id");
                Mutation::set(key, fields(json.clone()))
            })
            .collect();
        self.client
            .write_batch(mutations)
            .await
            .expect("local write failed")
            .committed()
            .await
            .expect("server rejected test collection");
        collection
    }
}

impl std::ops::Deref for TestDb {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Waits for the next snapshot on `stream`, failing the test after five
/// seconds.
pub async fn next_snapshot(stream: &mut SnapshotStream) -> ViewSnapshot {
    stream
        .next_timeout(Duration::from_secs(5))
        .await
        .expect("no snapshot within 5s")
        .expect("listener failed")
}

/// Takes snapshots from `stream` until one satisfies `predicate`.
pub async fn snapshot_where(
    stream: &mut SnapshotStream,
    mut predicate: impl FnMut(&ViewSnapshot) -> bool,
) -> ViewSnapshot {
    loop {
        let snapshot = next_snapshot(stream).await;
        if predicate(&snapshot) {
            return snapshot;
        }
    }
}

/// Polls `condition` every few milliseconds for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
