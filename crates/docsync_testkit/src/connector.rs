//! Connector that dials a [`MemoryServer`].

use crate::server::MemoryServer;
use async_trait::async_trait;
use docsync_engine::{Connection, Connector, SyncResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A [`Connector`] for an in-process [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
    attempts: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Creates a connector for `server`.
    pub fn new(server: &MemoryServer) -> Self {
        Self {
            server: server.clone(),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of connection attempts so far, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> SyncResult<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.server.accept()
    }
}
