//! Transport abstraction for the watch stream.

use crate::error::SyncResult;
use crate::protocol::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// An open, bidirectional watch connection.
///
/// Dropping `outbound` closes the client side; the server closes its side by
/// ending `inbound`.
#[derive(Debug)]
pub struct Connection {
    /// Messages to the server.
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Messages from the server, in order.
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Opens watch connections.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (WebSocket, gRPC, in-memory loopback for testing, etc.).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the server cannot be reached.
    async fn connect(&self) -> SyncResult<Connection>;
}
