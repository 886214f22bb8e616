//! Persistence gateway trait.

use crate::error::PersistenceResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Logical tables of the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Table {
    /// Remote document cache, keyed by document path.
    Documents,
    /// Pending mutation batches, keyed by big-endian batch id.
    Mutations,
    /// Client metadata: client id, batch id counter, checkpoint.
    Meta,
}

/// A single staged write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Insert or replace a value.
    Put {
        /// Table.
        table: Table,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove a key. Removing a missing key is not an error.
    Delete {
        /// Table.
        table: Table,
        /// Key bytes.
        key: Vec<u8>,
    },
}

/// An ordered set of writes that commit atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a put.
    pub fn put(&mut self, table: Table, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            table,
            key: key.into(),
            value,
        });
    }

    /// Stages a delete.
    pub fn delete(&mut self, table: Table, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            table,
            key: key.into(),
        });
    }

    /// Returns true if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the number of staged writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns the staged writes in order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the batch.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// A durable key-value store with atomic multi-key commits.
///
/// # Invariants
///
/// - `commit` applies every write of a batch or none of them
/// - after `commit` returns `Ok`, `get` and `scan` observe the batch
/// - writes within a batch apply in order, so a later op on the same key wins
pub trait Persistence: Send + Sync + fmt::Debug {
    /// Reads one value.
    fn get(&self, table: Table, key: &[u8]) -> PersistenceResult<Option<Vec<u8>>>;

    /// Returns every entry of a table in key order.
    fn scan(&self, table: Table) -> PersistenceResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically applies a batch of writes.
    fn commit(&self, batch: WriteBatch) -> PersistenceResult<()>;

    /// Forces buffered data to durable storage.
    fn flush(&self) -> PersistenceResult<()>;
}

/// Applies ops to an in-memory table set. Shared by the implementations.
pub(crate) fn apply_ops(
    tables: &mut BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>,
    ops: impl IntoIterator<Item = WriteOp>,
) {
    for op in ops {
        match op {
            WriteOp::Put { table, key, value } => {
                tables.entry(table).or_default().insert(key, value);
            }
            WriteOp::Delete { table, key } => {
                if let Some(entries) = tables.get_mut(&table) {
                    entries.remove(&key);
                }
            }
        }
    }
}

/// Read-your-writes staging area over a [`Persistence`].
///
/// Reads consult staged writes first. Nothing reaches storage until
/// [`StoreTransaction::commit`], which writes everything in one batch.
pub struct StoreTransaction<'a> {
    persistence: &'a dyn Persistence,
    staged: BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>,
    batch: WriteBatch,
}

impl<'a> StoreTransaction<'a> {
    /// Starts a transaction.
    pub fn new(persistence: &'a dyn Persistence) -> Self {
        Self {
            persistence,
            staged: BTreeMap::new(),
            batch: WriteBatch::new(),
        }
    }

    /// Reads through the staged writes.
    pub fn get(&self, table: Table, key: &[u8]) -> PersistenceResult<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(&(table, key.to_vec())) {
            return Ok(staged.clone());
        }
        self.persistence.get(table, key)
    }

    /// Stages a put.
    pub fn put(&mut self, table: Table, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        let key = key.into();
        self.staged.insert((table, key.clone()), Some(value.clone()));
        self.batch.put(table, key, value);
    }

    /// Stages a delete.
    pub fn delete(&mut self, table: Table, key: impl Into<Vec<u8>>) {
        let key = key.into();
        self.staged.insert((table, key.clone()), None);
        self.batch.delete(table, key);
    }

    /// Returns true if nothing has been staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Commits every staged write atomically. Empty transactions are free.
    pub fn commit(self) -> PersistenceResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.persistence.commit(self.batch)
    }
}
