//! # docsync model
//!
//! Supporting types shared by every docsync crate.
//!
//! This crate provides:
//! - [`ResourcePath`], [`DocumentKey`] and [`FieldPath`] addressing
//! - The dynamic [`Value`] type, including typed document references
//! - [`Document`] with its server version and existence state
//! - [`Mutation`] / [`MutationBatch`] and their local/remote application rules
//! - Declarative [`Query`] targets with matching and ordering
//!
//! This is a pure data crate with no I/O.
//!
//! ## Example
//!
//! ```
//! use docsync_model::{Direction, FilterOp, Query, Value};
//!
//! let query = Query::collection("rooms/eros/messages")
//!     .unwrap()
//!     .filter("filter", FilterOp::Equal, Value::Bool(true))
//!     .order_by("sort", Direction::Descending);
//! assert!(query.validate().is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod error;
mod mutation;
mod path;
mod query;
mod types;
mod value;

pub use document::{Document, Existence};
pub use error::{ModelError, ModelResult};
pub use mutation::{BatchState, Mutation, MutationBatch, MutationKind, Patch, Precondition};
pub use path::{DocumentKey, FieldPath, ResourcePath};
pub use query::{Direction, FieldFilter, FilterOp, OrderBy, Query};
pub use types::{BatchId, ResumeToken, SnapshotVersion, TargetId, Timestamp};
pub use value::{lookup_field, remove_field, set_field, Fields, Value};
