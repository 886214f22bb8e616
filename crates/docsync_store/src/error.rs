//! Error types for persistence operations.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Errors that can occur while reading or writing durable state.
///
/// The error is `Clone` so that a fatal failure can be fanned out to every
/// waiting caller.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Stored data failed an integrity check.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A write was refused by an injected fault.
    #[error("injected failure: {0}")]
    Injected(String),

    /// Another process holds the store.
    #[error("store at {} is locked by another process", .0.display())]
    Locked(PathBuf),

    /// A record was refused before it reached storage.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl PersistenceError {
    /// Creates a codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Creates a corruption error.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }
}

impl From<io::Error> for PersistenceError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
