//! Typed messages exchanged with the server over a watch connection.
//!
//! Byte framing is the connector's concern; the engine only sees these
//! values.

use docsync_model::{
    BatchId, Document, Mutation, Query, ResumeToken, SnapshotVersion, TargetId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First message on every connection.
    Handshake {
        /// Persistent client identity, used to deduplicate writes.
        client_id: Uuid,
    },
    /// Starts watching a query.
    AddTarget {
        /// Client-assigned target id.
        target_id: TargetId,
        /// The watched query.
        query: Query,
        /// Resume point from an earlier connection, if the target was
        /// current before.
        resume_token: Option<ResumeToken>,
    },
    /// Stops watching a target.
    RemoveTarget {
        /// Target to drop.
        target_id: TargetId,
    },
    /// Submits a mutation batch. Re-sending the same batch is safe.
    Write {
        /// Batch id, unique per client.
        batch_id: BatchId,
        /// Mutations to commit atomically.
        mutations: Vec<Mutation>,
    },
}

/// A message from the server, numbered per connection starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Per-connection sequence number.
    pub sequence: u64,
    /// Payload.
    pub body: ServerBody,
}

/// Server message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerBody {
    /// Document and target changes.
    Changes(ChangeBatch),
    /// A write batch was committed.
    WriteAck {
        /// The committed batch.
        batch_id: BatchId,
        /// Version at which it was committed.
        commit_version: SnapshotVersion,
    },
    /// A write batch was refused.
    WriteRejected {
        /// The refused batch.
        batch_id: BatchId,
        /// Error code.
        code: String,
        /// Error message.
        message: String,
    },
}

/// A consistent set of remote changes at one snapshot version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Server version these changes bring the client to.
    pub snapshot_version: SnapshotVersion,
    /// Token to resume every current target from this point.
    pub resume_token: ResumeToken,
    /// Changed documents and their target membership.
    pub documents: Vec<DocumentUpdate>,
    /// Target state transitions.
    pub target_changes: Vec<TargetChange>,
}

/// One document change and which targets it entered or left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    /// New document state (possibly a deletion).
    pub document: Document,
    /// Targets whose result set now contains the document.
    pub added_to: Vec<TargetId>,
    /// Targets whose result set no longer contains the document.
    pub removed_from: Vec<TargetId>,
}

/// A change in a target's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetChange {
    /// The target.
    pub target_id: TargetId,
    /// What happened.
    pub kind: TargetChangeKind,
}

/// Kinds of target change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetChangeKind {
    /// The server accepted the target.
    Added,
    /// The client now holds the complete result set.
    Current,
    /// Membership must be rebuilt from scratch.
    Reset,
    /// The server dropped the target.
    Removed {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
    },
}
