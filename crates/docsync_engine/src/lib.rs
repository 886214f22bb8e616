//! # docsync engine
//!
//! Realtime, offline-capable sync core for docsync clients.
//!
//! This crate provides:
//! - The [`Client`] handle: writes, reads and listeners
//! - Optimistic local writes that listeners see before any network round trip
//! - A watch stream that keeps query targets in sync with the server and
//!   reconnects with exponential backoff
//! - Limbo resolution for cached documents the server no longer confirms
//! - Snapshot delivery through callbacks or bounded [`SnapshotStream`]s
//!
//! ## Architecture
//!
//! One engine task owns all sync state and processes client commands and
//! stream events strictly one at a time:
//!
//! ```text
//! Client ──commands──▶ engine loop ◀──events── watch stream tasks
//!                        │    │
//!             LocalStore ┘    └─▶ listeners
//! ```
//!
//! ## Key Invariants
//!
//! - Read-your-writes: a write is visible locally before it is sent
//! - Pending writes survive restarts and are re-sent until acknowledged
//! - Server writes are deduplicated by `(client_id, batch_id)`
//! - Connectivity errors never reach writes or listeners; only persistence
//!   failures are fatal
//!
//! ## Example
//!
//! ```rust,ignore
//! use docsync_engine::{Client, ClientConfig, ListenOptions, Query};
//!
//! let client = Client::open(ClientConfig::default(), persistence, connector).await?;
//! let messages = Query::collection("rooms/eros/messages")?;
//! let registration = client.on_snapshot(messages, ListenOptions::new(), |event| {
//!     if let Ok(snapshot) = event {
//!         println!("{} messages", snapshot.len());
//!     }
//! })?;
//! registration.remove();
//! client.shutdown().await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod event_manager;
mod listener;
mod protocol;
mod query_engine;
mod snapshot;
mod sync_engine;
mod transport;
mod view;
mod watch_stream;

pub use client::{Client, PendingWrite, Source};
pub use config::{BackoffConfig, ClientConfig};
pub use error::{SyncError, SyncResult};
pub use listener::{ListenOptions, ListenerRegistration, SnapshotEvent, SnapshotStream};
pub use protocol::{
    ChangeBatch, ClientMessage, DocumentUpdate, ServerBody, ServerMessage, TargetChange,
    TargetChangeKind,
};
pub use query_engine::evaluate;
pub use snapshot::{ChangeType, DocumentChange, DocumentSnapshot, SnapshotMetadata, ViewSnapshot};
pub use transport::{Connection, Connector};
pub use view::QueryResult;
pub use watch_stream::StreamState;

pub use docsync_model::{
    BatchId, Direction, Document, DocumentKey, Existence, FieldPath, Fields, FilterOp, Mutation,
    Patch, Precondition, Query, ResourcePath, ResumeToken, SnapshotVersion, TargetId, Timestamp,
    Value,
};
