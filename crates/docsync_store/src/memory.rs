//! In-memory persistence for tests and ephemeral clients.

use crate::error::{PersistenceError, PersistenceResult};
use crate::persistence::{apply_ops, Persistence, Table, WriteBatch};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A [`Persistence`] backed by in-memory maps.
///
/// Data is lost when the value is dropped. Commits can be made to fail on
/// demand with [`MemoryPersistence::fail_commits`].
///
/// # Example
///
/// ```
/// use docsync_store::{MemoryPersistence, Persistence, Table, WriteBatch};
///
/// let store = MemoryPersistence::new();
/// let mut batch = WriteBatch::new();
/// batch.put(Table::Meta, b"key".to_vec(), b"value".to_vec());
/// store.commit(batch).unwrap();
/// assert_eq!(store.get(Table::Meta, b"key").unwrap(), Some(b"value".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    tables: RwLock<BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>>,
    fail_commits: AtomicBool,
    commits: AtomicU64,
}

impl MemoryPersistence {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every subsequent commit fails without writing anything.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of entries in a table.
    #[must_use]
    pub fn table_len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, BTreeMap::len)
    }
}

impl Persistence for MemoryPersistence {
    fn get(&self, table: Table, key: &[u8]) -> PersistenceResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn scan(&self, table: Table) -> PersistenceResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> PersistenceResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(PersistenceError::Injected("commit refused".into()));
        }
        apply_ops(&mut self.tables.write(), batch.into_ops());
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> PersistenceResult<()> {
        Ok(())
    }
}
