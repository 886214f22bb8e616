//! Local document cache with optimistic overlay.
//!
//! The [`LocalStore`] owns the remote document cache (the last state the
//! server confirmed), the [`MutationQueue`] and the remote checkpoint. The
//! local view of a document is its remote state with every pending batch
//! applied in batch-id order.

use crate::codec::{decode_record, encode_record};
use crate::error::PersistenceResult;
use crate::mutation_queue::MutationQueue;
use crate::persistence::{Persistence, StoreTransaction, Table};
use docsync_model::{
    BatchId, BatchState, Document, DocumentKey, Existence, Mutation, MutationBatch, Query,
    ResourcePath, SnapshotVersion,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

const CLIENT_ID_KEY: &[u8] = b"client_id";
const CHECKPOINT_KEY: &[u8] = b"snapshot_version";

/// Remote cache, pending mutations and checkpoint of one client.
///
/// All writes go through a single [`StoreTransaction`] per operation, so a
/// failed commit leaves both storage and the in-memory mirror untouched.
#[derive(Debug)]
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    remote: BTreeMap<DocumentKey, Document>,
    queue: MutationQueue,
    client_id: Uuid,
    checkpoint: SnapshotVersion,
}

impl LocalStore {
    /// Opens the store, generating and persisting a client id on first use.
    pub fn open(persistence: Arc<dyn Persistence>) -> PersistenceResult<Self> {
        let client_id = match persistence.get(Table::Meta, CLIENT_ID_KEY)? {
            Some(bytes) => decode_record(&bytes)?,
            None => {
                let id = Uuid::new_v4();
                let mut txn = StoreTransaction::new(persistence.as_ref());
                txn.put(Table::Meta, CLIENT_ID_KEY, encode_record(&id)?);
                txn.commit()?;
                id
            }
        };
        let checkpoint = match persistence.get(Table::Meta, CHECKPOINT_KEY)? {
            Some(bytes) => decode_record(&bytes)?,
            None => SnapshotVersion::NONE,
        };

        let mut remote = BTreeMap::new();
        for (_, value) in persistence.scan(Table::Documents)? {
            let doc: Document = decode_record(&value)?;
            remote.insert(doc.key.clone(), doc);
        }
        let queue = MutationQueue::load(Arc::clone(&persistence))?;

        tracing::info!(
            %client_id,
            %checkpoint,
            documents = remote.len(),
            pending = queue.len(),
            "opened local store"
        );
        Ok(Self {
            persistence,
            remote,
            queue,
            client_id,
            checkpoint,
        })
    }

    /// The persistent identity of this client.
    #[must_use]
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Version of the last remote snapshot applied.
    #[must_use]
    pub fn checkpoint(&self) -> SnapshotVersion {
        self.checkpoint
    }

    /// Moves the checkpoint to `checkpoint`, even backwards. Used when the
    /// server starts over with a full re-sync.
    pub fn rebase_checkpoint(&mut self, checkpoint: SnapshotVersion) -> PersistenceResult<()> {
        if checkpoint == self.checkpoint {
            return Ok(());
        }
        let mut txn = StoreTransaction::new(self.persistence.as_ref());
        txn.put(Table::Meta, CHECKPOINT_KEY, encode_record(&checkpoint)?);
        txn.commit()?;
        tracing::debug!(from = %self.checkpoint, to = %checkpoint, "checkpoint rebased");
        self.checkpoint = checkpoint;
        Ok(())
    }

    /// The pending mutation queue.
    #[must_use]
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// The last server-confirmed state of a document, if cached.
    #[must_use]
    pub fn remote_document(&self, key: &DocumentKey) -> Option<&Document> {
        self.remote.get(key)
    }

    /// Returns true if a pending batch touches `key`.
    #[must_use]
    pub fn has_pending_writes(&self, key: &DocumentKey) -> bool {
        self.queue.batches_affecting(key).next().is_some()
    }

    /// The local view of a document: remote state plus pending batches.
    #[must_use]
    pub fn local_document(&self, key: &DocumentKey) -> Option<Document> {
        self.queue
            .batches_affecting(key)
            .fold(self.remote.get(key).cloned(), |doc, batch| {
                batch.apply_to_local(key, doc)
            })
    }

    /// Local views of every cached or locally written document directly in
    /// `collection`, in key order.
    #[must_use]
    pub fn local_documents_in(&self, collection: &ResourcePath) -> Vec<Document> {
        let mut keys: BTreeSet<&DocumentKey> = self
            .remote
            .keys()
            .filter(|key| collection.is_immediate_parent_of(key.path()))
            .collect();
        for batch in self.queue.all_batches() {
            keys.extend(
                batch
                    .keys()
                    .filter(|key| collection.is_immediate_parent_of(key.path())),
            );
        }
        keys.into_iter()
            .filter_map(|key| self.local_document(key))
            .collect()
    }

    /// Local views of every candidate document for a query.
    #[must_use]
    pub fn local_documents_for(&self, query: &Query) -> Vec<Document> {
        match query.document_key() {
            Some(key) => self.local_document(&key).into_iter().collect(),
            None => self.local_documents_in(&query.path),
        }
    }

    /// Persists a new pending batch.
    pub fn enqueue_batch(&mut self, mutations: Vec<Mutation>) -> PersistenceResult<MutationBatch> {
        self.queue.enqueue(mutations)
    }

    /// Merges server documents into the remote cache and advances the
    /// checkpoint, in one commit.
    ///
    /// A document replaces the cached entry only when its version is newer,
    /// or equal while the cached entry is of unknown existence. Returns the
    /// keys whose cached state changed.
    pub fn apply_remote_documents(
        &mut self,
        documents: Vec<Document>,
        checkpoint: SnapshotVersion,
    ) -> PersistenceResult<Vec<DocumentKey>> {
        let accepted: Vec<Document> = documents
            .into_iter()
            .filter(|doc| self.should_replace(doc))
            .map(|doc| doc.with_local_mutations(false))
            .collect();
        let advance = checkpoint > self.checkpoint;
        if accepted.is_empty() && !advance {
            return Ok(Vec::new());
        }

        let mut txn = StoreTransaction::new(self.persistence.as_ref());
        for doc in &accepted {
            txn.put(Table::Documents, doc.key.to_string(), encode_record(doc)?);
        }
        if advance {
            txn.put(Table::Meta, CHECKPOINT_KEY, encode_record(&checkpoint)?);
        }
        txn.commit()?;

        if advance {
            self.checkpoint = checkpoint;
        }
        let changed = accepted.iter().map(|doc| doc.key.clone()).collect();
        for doc in accepted {
            self.remote.insert(doc.key.clone(), doc);
        }
        Ok(changed)
    }

    fn should_replace(&self, incoming: &Document) -> bool {
        match self.remote.get(&incoming.key) {
            None => true,
            Some(cached) => {
                incoming.version > cached.version
                    || (incoming.version == cached.version
                        && cached.existence == Existence::Unknown
                        && incoming.existence != Existence::Unknown)
            }
        }
    }

    /// Applies an acknowledged batch to the remote cache at
    /// `commit_version` and removes it from the queue, in one commit.
    ///
    /// Documents the server already reported at a newer version are left
    /// alone. Returns `None` if the batch was already removed.
    pub fn acknowledge_batch(
        &mut self,
        batch_id: BatchId,
        commit_version: SnapshotVersion,
    ) -> PersistenceResult<Option<MutationBatch>> {
        let Some(batch) = self.queue.lookup(batch_id) else {
            return Ok(None);
        };

        let mut updated: BTreeMap<DocumentKey, Document> = BTreeMap::new();
        for mutation in &batch.mutations {
            let base = updated
                .get(&mutation.key)
                .or_else(|| self.remote.get(&mutation.key))
                .cloned();
            if base.as_ref().is_some_and(|doc| doc.version > commit_version) {
                continue;
            }
            let doc = mutation.apply_to_remote(base, commit_version);
            updated.insert(doc.key.clone(), doc);
        }

        let mut txn = StoreTransaction::new(self.persistence.as_ref());
        for doc in updated.values() {
            txn.put(Table::Documents, doc.key.to_string(), encode_record(doc)?);
        }
        self.queue.stage_remove(&mut txn, batch_id);
        txn.commit()?;

        self.remote.extend(updated);
        Ok(self.queue.finish_remove(batch_id, BatchState::Acknowledged))
    }

    /// Removes a rejected batch; its effect disappears from the local view.
    /// Returns `None` if the batch was already removed.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> PersistenceResult<Option<MutationBatch>> {
        self.queue.reject(batch_id)
    }
}
