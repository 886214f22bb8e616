//! Error types for the model crate.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while building paths, batches or queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A slash-separated resource path is malformed.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A dotted field path is malformed.
    #[error("invalid field path {path:?}")]
    InvalidFieldPath {
        /// The offending field path.
        path: String,
    },

    /// A query combines clauses that cannot be evaluated.
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// Description of the problem.
        reason: String,
    },

    /// A mutation batch must carry at least one mutation.
    #[error("mutation batch must contain at least one mutation")]
    EmptyBatch,
}

impl ModelError {
    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid query error.
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }
}
