//! Durable queue of pending mutation batches.

use crate::codec::{decode_record, encode_record};
use crate::error::{PersistenceError, PersistenceResult};
use crate::persistence::{Persistence, StoreTransaction, Table};
use docsync_model::{BatchId, BatchState, DocumentKey, Mutation, MutationBatch};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) const NEXT_BATCH_ID_KEY: &[u8] = b"next_batch_id";

/// Pending mutation batches in batch-id order.
///
/// Batches are persisted before `enqueue` returns and stay queued until the
/// server acknowledges or rejects them. Batch ids are never reused, even
/// across restarts, because the next id is persisted with every enqueue.
#[derive(Debug)]
pub struct MutationQueue {
    persistence: Arc<dyn Persistence>,
    batches: BTreeMap<BatchId, MutationBatch>,
    next_batch_id: BatchId,
}

impl MutationQueue {
    /// Loads the queue from persistence.
    pub fn load(persistence: Arc<dyn Persistence>) -> PersistenceResult<Self> {
        let mut batches = BTreeMap::new();
        for (_, value) in persistence.scan(Table::Mutations)? {
            let batch: MutationBatch = decode_record(&value)?;
            batches.insert(batch.batch_id, batch);
        }

        let stored_next = match persistence.get(Table::Meta, NEXT_BATCH_ID_KEY)? {
            Some(bytes) => decode_record::<u64>(&bytes)?,
            None => 1,
        };
        let after_last = batches
            .keys()
            .next_back()
            .map_or(1, |id: &BatchId| id.as_u64() + 1);
        let next_batch_id = BatchId::new(stored_next.max(after_last).max(1));

        tracing::debug!(pending = batches.len(), next = %next_batch_id, "loaded mutation queue");
        Ok(Self {
            persistence,
            batches,
            next_batch_id,
        })
    }

    /// The id the next enqueued batch will receive.
    #[must_use]
    pub fn next_batch_id(&self) -> BatchId {
        self.next_batch_id
    }

    /// Persists a new batch and returns it with its assigned id.
    pub fn enqueue(&mut self, mutations: Vec<Mutation>) -> PersistenceResult<MutationBatch> {
        let persistence = Arc::clone(&self.persistence);
        let mut txn = StoreTransaction::new(persistence.as_ref());
        let batch = self.stage_enqueue(&mut txn, mutations)?;
        txn.commit()?;
        self.finish_enqueue(batch.clone());
        Ok(batch)
    }

    pub(crate) fn stage_enqueue(
        &self,
        txn: &mut StoreTransaction<'_>,
        mutations: Vec<Mutation>,
    ) -> PersistenceResult<MutationBatch> {
        let batch = MutationBatch::new(self.next_batch_id, mutations)
            .map_err(|e| PersistenceError::InvalidRecord(e.to_string()))?;
        txn.put(Table::Mutations, batch.batch_id.to_key(), encode_record(&batch)?);
        txn.put(
            Table::Meta,
            NEXT_BATCH_ID_KEY,
            encode_record(&self.next_batch_id.next().as_u64())?,
        );
        Ok(batch)
    }

    pub(crate) fn finish_enqueue(&mut self, batch: MutationBatch) {
        self.next_batch_id = batch.batch_id.next();
        tracing::debug!(batch_id = %batch.batch_id, mutations = batch.mutations.len(), "enqueued batch");
        self.batches.insert(batch.batch_id, batch);
    }

    /// Removes an acknowledged batch. Returns `None` if it was already gone.
    pub fn acknowledge(&mut self, batch_id: BatchId) -> PersistenceResult<Option<MutationBatch>> {
        self.remove(batch_id, BatchState::Acknowledged)
    }

    /// Removes a rejected batch. Returns `None` if it was already gone.
    pub fn reject(&mut self, batch_id: BatchId) -> PersistenceResult<Option<MutationBatch>> {
        self.remove(batch_id, BatchState::Rejected)
    }

    fn remove(
        &mut self,
        batch_id: BatchId,
        state: BatchState,
    ) -> PersistenceResult<Option<MutationBatch>> {
        if !self.batches.contains_key(&batch_id) {
            return Ok(None);
        }
        let persistence = Arc::clone(&self.persistence);
        let mut txn = StoreTransaction::new(persistence.as_ref());
        self.stage_remove(&mut txn, batch_id);
        txn.commit()?;
        Ok(self.finish_remove(batch_id, state))
    }

    pub(crate) fn stage_remove(&self, txn: &mut StoreTransaction<'_>, batch_id: BatchId) {
        txn.delete(Table::Mutations, batch_id.to_key());
    }

    pub(crate) fn finish_remove(
        &mut self,
        batch_id: BatchId,
        state: BatchState,
    ) -> Option<MutationBatch> {
        let mut batch = self.batches.remove(&batch_id)?;
        batch.state = state;
        tracing::debug!(batch_id = %batch_id, ?state, "removed batch");
        Some(batch)
    }

    /// Looks up a pending batch.
    #[must_use]
    pub fn lookup(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// Every pending batch in id order.
    pub fn all_batches(&self) -> impl Iterator<Item = &MutationBatch> {
        self.batches.values()
    }

    /// Pending batches with id less than or equal to `batch_id`.
    pub fn batches_up_to(&self, batch_id: BatchId) -> impl Iterator<Item = &MutationBatch> {
        self.batches.range(..=batch_id).map(|(_, batch)| batch)
    }

    /// Pending batches that touch `key`, in id order.
    pub fn batches_affecting<'a>(
        &'a self,
        key: &'a DocumentKey,
    ) -> impl Iterator<Item = &'a MutationBatch> + 'a {
        self.batches.values().filter(move |batch| batch.affects(key))
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of pending batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.len()
    }
}
