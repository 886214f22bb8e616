//! # docsync store
//!
//! Durable client state for docsync.
//!
//! This crate provides:
//! - The [`Persistence`] gateway trait: a key-value store with atomic
//!   multi-key commits over three tables
//! - [`MemoryPersistence`] for tests and ephemeral clients
//! - [`FilePersistence`], an append-only, checksummed commit log
//! - The [`MutationQueue`] of pending write batches
//! - The [`LocalStore`], which combines the remote document cache with the
//!   queue to produce the optimistic local view
//!
//! Records are encoded as CBOR; commit log frames carry a CRC32.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod file;
mod frame;
mod local_store;
mod memory;
mod mutation_queue;
mod persistence;

pub use codec::{decode_record, encode_record};
pub use error::{PersistenceError, PersistenceResult};
pub use file::{FilePersistence, FilePersistenceConfig};
pub use frame::{crc32, decode_frame, encode_frame, FRAME_MAGIC, FRAME_VERSION};
pub use local_store::LocalStore;
pub use memory::MemoryPersistence;
pub use mutation_queue::MutationQueue;
pub use persistence::{Persistence, StoreTransaction, Table, WriteBatch, WriteOp};
