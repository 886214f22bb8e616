//! # docsync testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - [`MemoryServer`], an authoritative in-memory backend with fault
//!   injection (offline mode, forced disconnects, write and listen
//!   rejection, sequence gaps)
//! - [`MemoryConnector`] to wire clients to it
//! - Fixtures: [`TestDb`], random paths, JSON field helpers, `init_tracing`
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn reads_own_writes() {
//!     let db = TestDb::new().await;
//!     let key = db.with_test_doc(serde_json::json!({"name": "alice"})).await;
//!     let snapshot = db.get(&key, Source::Cache).await.unwrap();
//!     assert!(snapshot.exists());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connector;
pub mod fixtures;
pub mod generators;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connector::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
    pub use docsync_engine::*;
}

pub use connector::*;
pub use fixtures::*;
pub use generators::*;
pub use server::*;
