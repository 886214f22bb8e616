//! Error types for the sync engine.

use docsync_model::{BatchId, DocumentKey, ModelError};
use docsync_store::PersistenceError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the client and the sync engine.
///
/// Per-write errors resolve only that write. Connectivity problems never
/// reach writes or listeners; only `PersistenceFailure` is fatal.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// A precondition failed against the current local view.
    #[error("precondition failed for {key}: {reason}")]
    PreconditionFailed {
        /// Document whose precondition failed.
        key: DocumentKey,
        /// Description of the failure.
        reason: String,
    },

    /// The server refused a write batch.
    #[error("{batch_id} rejected by server ({code}): {message}")]
    Rejected {
        /// The rejected batch.
        batch_id: BatchId,
        /// Server error code.
        code: String,
        /// Server error message.
        message: String,
    },

    /// The server could not be reached.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// Server messages arrived out of order.
    #[error("protocol gap: expected {expected}, received {received}")]
    ProtocolGap {
        /// Expected sequence number or checkpoint.
        expected: u64,
        /// What actually arrived.
        received: u64,
    },

    /// Durable storage failed; the engine halts.
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] PersistenceError),

    /// A query is structurally invalid.
    #[error("invalid query: {0}")]
    InvalidQuery(ModelError),

    /// An argument such as a path or batch is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ModelError),

    /// The engine stopped after a fatal error.
    #[error("sync engine halted after a fatal error")]
    Halted,

    /// The client has been shut down.
    #[error("client has been shut down")]
    ClientShutdown,

    /// The server refused a listen target.
    #[error("listen rejected ({code}): {message}")]
    ListenRejected {
        /// Server error code.
        code: String,
        /// Server error message.
        message: String,
    },

    /// A bounded wait elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether reconnecting may help.
        retryable: bool,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a precondition failure.
    pub fn precondition_failed(key: &DocumentKey, reason: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    /// Returns true if reconnecting or retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NetworkUnavailable | SyncError::ProtocolGap { .. } => {
                true
            }
            _ => false,
        }
    }

    /// Returns true if the error stops the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::PersistenceFailure(_) | SyncError::Halted)
    }
}
