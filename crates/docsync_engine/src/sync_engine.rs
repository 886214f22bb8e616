//! The sync engine: local writes, remote reconciliation and target
//! bookkeeping.
//!
//! The engine is a plain state machine without any I/O of its own besides
//! the local store. Every operation records its outward effects (view
//! updates, protocol messages, write outcomes) in [`EngineEffects`], which
//! the client loop drains after each step.
//!
//! ## Invariants
//!
//! - A local write is visible in every affected view before any message for
//!   it is sent.
//! - Remote documents replace cached ones only when strictly newer.
//! - Watch errors never drop pending batches or listened targets.
//! - After a persistence failure the engine is halted for good.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ChangeBatch, ClientMessage, ServerBody, ServerMessage, TargetChangeKind};
use crate::view::{QueryResult, QueryView, TargetPurpose, TargetState};
use docsync_model::{
    BatchId, Document, DocumentKey, ModelError, Mutation, MutationBatch, Query, SnapshotVersion,
    TargetId,
};
use docsync_store::{LocalStore, PersistenceError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Identity of a listened query: its canonical id.
pub(crate) type QueryId = String;

/// Outward effects of engine operations, drained by the client loop.
#[derive(Debug, Default)]
pub(crate) struct EngineEffects {
    /// Views whose result changed.
    pub(crate) views: Vec<(QueryId, QueryResult)>,
    /// Messages for the server, in order.
    pub(crate) messages: Vec<ClientMessage>,
    /// Server outcomes of write batches.
    pub(crate) write_results: Vec<(BatchId, SyncResult<SnapshotVersion>)>,
    /// Queries the server refused; their listeners are dropped.
    pub(crate) listen_errors: Vec<(QueryId, SyncError)>,
    /// Set once when the engine halts.
    pub(crate) fatal: Option<SyncError>,
}

impl EngineEffects {
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.views.is_empty()
            && self.messages.is_empty()
            && self.write_results.is_empty()
            && self.listen_errors.is_empty()
            && self.fatal.is_none()
    }
}

#[derive(Debug)]
struct QueryEntry {
    view: QueryView,
    listeners: usize,
}

/// Client-side sync state.
#[derive(Debug)]
pub(crate) struct SyncEngine {
    store: LocalStore,
    online: bool,
    halted: bool,
    /// Set by a protocol gap until the first change batch of the re-sync.
    resyncing: bool,
    next_target_id: u32,
    targets: BTreeMap<TargetId, TargetState>,
    queries: HashMap<QueryId, QueryEntry>,
    limbo_targets: BTreeMap<DocumentKey, TargetId>,
    effects: EngineEffects,
}

impl SyncEngine {
    pub(crate) fn new(store: LocalStore) -> Self {
        Self {
            store,
            online: false,
            halted: false,
            resyncing: false,
            next_target_id: 1,
            targets: BTreeMap::new(),
            queries: HashMap::new(),
            limbo_targets: BTreeMap::new(),
            effects: EngineEffects::default(),
        }
    }

    pub(crate) fn client_id(&self) -> Uuid {
        self.store.client_id()
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted
    }

    /// Number of batches not yet acknowledged or rejected.
    pub(crate) fn pending_count(&self) -> usize {
        self.store.queue().len()
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.store.queue().is_empty()
    }

    pub(crate) fn take_effects(&mut self) -> EngineEffects {
        std::mem::take(&mut self.effects)
    }

    /// Starts listening to a query and returns its current local result.
    ///
    /// Listeners of equal queries share one view and one target.
    pub(crate) fn listen(&mut self, query: Query) -> SyncResult<(QueryId, QueryResult)> {
        query.validate().map_err(SyncError::InvalidQuery)?;
        let query_id = query.canonical_id();

        if let Some(entry) = self.queries.get_mut(&query_id) {
            entry.listeners += 1;
            let target = self.targets.get(&entry.view.target_id);
            let candidates = self.store.local_documents_for(&entry.view.query);
            let result = entry.view.compute(candidates, target, self.online);
            return Ok((query_id, result));
        }

        let target_id = self.allocate_target_id();
        self.targets
            .insert(target_id, TargetState::new(query.clone(), TargetPurpose::Listen));
        self.effects.messages.push(ClientMessage::AddTarget {
            target_id,
            query: query.clone(),
            resume_token: None,
        });

        let mut view = QueryView::new(target_id, query);
        let candidates = self.store.local_documents_for(&view.query);
        let result = view.compute(candidates, self.targets.get(&target_id), self.online);
        view.last = Some(result.clone());
        tracing::debug!(%target_id, query = %query_id, "listening");
        self.queries
            .insert(query_id.clone(), QueryEntry { view, listeners: 1 });
        Ok((query_id, result))
    }

    /// Drops one listener of a query. The target is released with the last
    /// listener.
    pub(crate) fn unlisten(&mut self, query_id: &str) {
        let Some(entry) = self.queries.get_mut(query_id) else {
            return;
        };
        entry.listeners = entry.listeners.saturating_sub(1);
        if entry.listeners > 0 {
            return;
        }
        if let Some(entry) = self.queries.remove(query_id) {
            let target_id = entry.view.target_id;
            self.targets.remove(&target_id);
            self.effects
                .messages
                .push(ClientMessage::RemoveTarget { target_id });
            tracing::debug!(%target_id, query = %query_id, "stopped listening");
        }
        self.reconcile_limbo();
    }

    /// Releases every target, as part of shutdown.
    pub(crate) fn release_all(&mut self) {
        for target_id in self.targets.keys() {
            self.effects.messages.push(ClientMessage::RemoveTarget {
                target_id: *target_id,
            });
        }
        self.targets.clear();
        self.queries.clear();
        self.limbo_targets.clear();
    }

    /// The local result of a query, without listening.
    pub(crate) fn peek(&self, query: &Query) -> SyncResult<QueryResult> {
        query.validate().map_err(SyncError::InvalidQuery)?;
        let mut view = QueryView::new(TargetId::new(0), query.clone());
        let candidates = self.store.local_documents_for(query);
        Ok(view.compute(candidates, None, false))
    }

    /// Validates, persists and locally applies a write batch.
    ///
    /// Preconditions are checked against the local view as it evolves
    /// through the batch. Nothing is enqueued if any of them fails.
    pub(crate) fn write(&mut self, mutations: Vec<Mutation>) -> SyncResult<MutationBatch> {
        if self.halted {
            return Err(SyncError::Halted);
        }
        if mutations.is_empty() {
            return Err(SyncError::InvalidArgument(ModelError::EmptyBatch));
        }

        let mut overlay: HashMap<DocumentKey, Option<Document>> = HashMap::new();
        for mutation in &mutations {
            let base = match overlay.get(&mutation.key) {
                Some(doc) => doc.clone(),
                None => self.store.local_document(&mutation.key),
            };
            if !mutation.precondition.is_valid_for(base.as_ref()) {
                return Err(SyncError::precondition_failed(
                    &mutation.key,
                    format!("{:?} does not hold", mutation.precondition),
                ));
            }
            let next = mutation.apply_to_local(base);
            overlay.insert(mutation.key.clone(), next);
        }

        let batch = match self.store.enqueue_batch(mutations) {
            Ok(batch) => batch,
            Err(err) => return Err(self.fail(err)),
        };

        self.recompute_views();
        self.reconcile_limbo();
        self.effects.messages.push(ClientMessage::Write {
            batch_id: batch.batch_id,
            mutations: batch.mutations.clone(),
        });
        Ok(batch)
    }

    /// Applies one in-order server message.
    ///
    /// Returns `ProtocolGap` when a change batch goes back behind the
    /// checkpoint; the caller must force a full re-sync.
    pub(crate) fn apply_server_message(&mut self, message: ServerMessage) -> SyncResult<()> {
        if self.halted {
            return Ok(());
        }
        match message.body {
            ServerBody::WriteAck {
                batch_id,
                commit_version,
            } => self.acknowledge(batch_id, commit_version),
            ServerBody::WriteRejected {
                batch_id,
                code,
                message,
            } => self.reject(batch_id, code, message),
            ServerBody::Changes(changes) => self.apply_changes(changes),
        }
    }

    fn acknowledge(&mut self, batch_id: BatchId, commit_version: SnapshotVersion) -> SyncResult<()> {
        match self.store.acknowledge_batch(batch_id, commit_version) {
            Ok(Some(_)) => {
                tracing::debug!(%batch_id, %commit_version, "batch acknowledged");
                self.effects
                    .write_results
                    .push((batch_id, Ok(commit_version)));
                self.recompute_views();
                self.reconcile_limbo();
                Ok(())
            }
            Ok(None) => {
                tracing::debug!(%batch_id, "ignoring acknowledgment of unknown batch");
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn reject(&mut self, batch_id: BatchId, code: String, message: String) -> SyncResult<()> {
        match self.store.reject_batch(batch_id) {
            Ok(Some(_)) => {
                tracing::debug!(%batch_id, %code, "batch rejected, rolling back");
                self.effects.write_results.push((
                    batch_id,
                    Err(SyncError::Rejected {
                        batch_id,
                        code,
                        message,
                    }),
                ));
                self.recompute_views();
                self.reconcile_limbo();
                Ok(())
            }
            Ok(None) => {
                tracing::debug!(%batch_id, "ignoring rejection of unknown batch");
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn apply_changes(&mut self, changes: ChangeBatch) -> SyncResult<()> {
        let checkpoint = self.store.checkpoint();
        if changes.snapshot_version < checkpoint {
            if !self.resyncing {
                return Err(SyncError::ProtocolGap {
                    expected: checkpoint.as_u64(),
                    received: changes.snapshot_version.as_u64(),
                });
            }
            // The server starts over; its first batch is the new baseline.
            if let Err(err) = self.store.rebase_checkpoint(changes.snapshot_version) {
                return Err(self.fail(err));
            }
        }
        self.resyncing = false;
        let version = changes.snapshot_version;
        let mut documents = Vec::with_capacity(changes.documents.len());
        let mut became_current = Vec::new();

        for change in changes.target_changes {
            match change.kind {
                TargetChangeKind::Added => {}
                TargetChangeKind::Current => became_current.push(change.target_id),
                TargetChangeKind::Reset => {
                    if let Some(target) = self.targets.get_mut(&change.target_id) {
                        target.reset();
                        target.resume_token = None;
                    }
                }
                TargetChangeKind::Removed { code, message } => {
                    if let Some(doc) = self.drop_target(change.target_id, code, message, version) {
                        documents.push(doc);
                    }
                }
            }
        }

        for update in changes.documents {
            let key = &update.document.key;
            for target_id in &update.added_to {
                if let Some(target) = self.targets.get_mut(target_id) {
                    target.remote_keys.insert(key.clone());
                }
            }
            for target_id in &update.removed_from {
                if let Some(target) = self.targets.get_mut(target_id) {
                    target.remote_keys.remove(key);
                }
            }
            documents.push(update.document);
        }

        for target_id in &became_current {
            let Some(target) = self.targets.get_mut(target_id) else {
                continue;
            };
            target.current = true;
            // A single-document target that is current without its key
            // proves the document does not exist.
            if let Some(key) = target.query.document_key() {
                let delivered = documents.iter().any(|doc| doc.key == key);
                if !target.remote_keys.contains(&key) && !delivered {
                    documents.push(Document::deleted(key, version));
                }
            }
        }
        if !changes.resume_token.is_empty() {
            for target in self.targets.values_mut().filter(|t| t.current) {
                target.resume_token = Some(changes.resume_token.clone());
            }
        }

        if let Err(err) = self.store.apply_remote_documents(documents, version) {
            return Err(self.fail(err));
        }
        self.recompute_views();
        self.reconcile_limbo();
        Ok(())
    }

    /// Handles a server-side target removal. Returns a synthesized deletion
    /// for limbo targets.
    fn drop_target(
        &mut self,
        target_id: TargetId,
        code: String,
        message: String,
        version: SnapshotVersion,
    ) -> Option<Document> {
        let target = self.targets.remove(&target_id)?;
        match target.purpose {
            TargetPurpose::Limbo => {
                let key = target.query.document_key()?;
                self.limbo_targets.remove(&key);
                tracing::debug!(%key, %code, "limbo target removed by server, treating as deleted");
                Some(Document::deleted(key, version))
            }
            TargetPurpose::Listen => {
                let query_id = self
                    .queries
                    .iter()
                    .find(|(_, entry)| entry.view.target_id == target_id)
                    .map(|(id, _)| id.clone())?;
                self.queries.remove(&query_id);
                tracing::warn!(%target_id, %code, %message, "listen target rejected by server");
                self.effects
                    .listen_errors
                    .push((query_id, SyncError::ListenRejected { code, message }));
                None
            }
        }
    }

    /// The stream connected: re-declare targets and re-send pending batches.
    pub(crate) fn on_connected(&mut self) {
        self.online = true;
        self.drop_limbo_targets();
        self.effects.messages.push(ClientMessage::Handshake {
            client_id: self.store.client_id(),
        });
        for (target_id, target) in &mut self.targets {
            target.current = false;
            if target.resume_token.is_none() {
                target.remote_keys.clear();
            }
            self.effects.messages.push(ClientMessage::AddTarget {
                target_id: *target_id,
                query: target.query.clone(),
                resume_token: target.resume_token.clone(),
            });
        }
        let pending: Vec<ClientMessage> = self
            .store
            .queue()
            .all_batches()
            .map(|batch| ClientMessage::Write {
                batch_id: batch.batch_id,
                mutations: batch.mutations.clone(),
            })
            .collect();
        if !pending.is_empty() {
            tracing::debug!(batches = pending.len(), "re-sending pending batches");
        }
        self.effects.messages.extend(pending);
        self.recompute_views();
    }

    /// The stream dropped: every view is served from cache until the
    /// targets are current again.
    pub(crate) fn on_disconnected(&mut self) {
        self.online = false;
        for target in self.targets.values_mut() {
            target.current = false;
        }
        self.drop_limbo_targets();
        self.recompute_views();
    }

    /// Sequence or checkpoint gap: forget resume tokens and membership so
    /// every target re-syncs from scratch.
    pub(crate) fn on_protocol_gap(&mut self) {
        tracing::warn!(targets = self.targets.len(), "dropping resume state for full re-sync");
        self.resyncing = true;
        for target in self.targets.values_mut() {
            target.reset();
            target.resume_token = None;
        }
        self.on_disconnected();
    }

    fn drop_limbo_targets(&mut self) {
        for (_, target_id) in std::mem::take(&mut self.limbo_targets) {
            self.targets.remove(&target_id);
        }
    }

    fn allocate_target_id(&mut self) -> TargetId {
        let id = TargetId::new(self.next_target_id);
        self.next_target_id = self.next_target_id.wrapping_add(1).max(1);
        id
    }

    fn recompute_views(&mut self) {
        for (query_id, entry) in &mut self.queries {
            let candidates = self.store.local_documents_for(&entry.view.query);
            let target = self.targets.get(&entry.view.target_id);
            if let Some(result) = entry.view.refresh(candidates, target, self.online) {
                self.effects.views.push((query_id.clone(), result));
            }
        }
    }

    /// Starts and stops limbo targets so exactly the documents in limbo in
    /// some view are being resolved.
    fn reconcile_limbo(&mut self) {
        let desired: BTreeSet<DocumentKey> = self
            .queries
            .values()
            .flat_map(|entry| entry.view.limbo_keys.iter().cloned())
            .collect();

        let resolved: Vec<DocumentKey> = self
            .limbo_targets
            .keys()
            .filter(|key| !desired.contains(*key))
            .cloned()
            .collect();
        for key in resolved {
            if let Some(target_id) = self.limbo_targets.remove(&key) {
                self.targets.remove(&target_id);
                self.effects
                    .messages
                    .push(ClientMessage::RemoveTarget { target_id });
                tracing::debug!(%key, %target_id, "limbo resolved");
            }
        }

        for key in desired {
            if self.limbo_targets.contains_key(&key) {
                continue;
            }
            let target_id = self.allocate_target_id();
            let query = Query::document(&key);
            self.targets
                .insert(target_id, TargetState::new(query.clone(), TargetPurpose::Limbo));
            self.effects.messages.push(ClientMessage::AddTarget {
                target_id,
                query,
                resume_token: None,
            });
            tracing::debug!(%key, %target_id, "document in limbo, resolving");
            self.limbo_targets.insert(key, target_id);
        }
    }

    /// Halts the engine after a persistence failure.
    fn fail(&mut self, err: PersistenceError) -> SyncError {
        let error = SyncError::PersistenceFailure(err);
        if !self.halted {
            tracing::error!(error = %error, "persistence failed, halting sync engine");
            self.halted = true;
            self.effects.fatal = Some(error.clone());
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DocumentUpdate, TargetChange};
    use docsync_model::{Fields, Precondition, ResumeToken, Value};
    use docsync_store::MemoryPersistence;
    use std::sync::Arc;

    fn engine() -> (SyncEngine, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = LocalStore::open(persistence.clone()).unwrap();
        (SyncEngine::new(store), persistence)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn fields(n: i64) -> Fields {
        let mut f = Fields::new();
        f.insert("n".into(), Value::Integer(n));
        f
    }

    fn items() -> Query {
        Query::collection("items").unwrap()
    }

    fn changes(
        version: u64,
        documents: Vec<DocumentUpdate>,
        target_changes: Vec<TargetChange>,
    ) -> ServerMessage {
        ServerMessage {
            sequence: 1,
            body: ServerBody::Changes(ChangeBatch {
                snapshot_version: SnapshotVersion::new(version),
                resume_token: ResumeToken::new(version.to_be_bytes().to_vec()),
                documents,
                target_changes,
            }),
        }
    }

    fn found(path: &str, version: u64, target: TargetId) -> DocumentUpdate {
        DocumentUpdate {
            document: Document::found(key(path), SnapshotVersion::new(version), fields(1)),
            added_to: vec![target],
            removed_from: vec![],
        }
    }

    fn current(target_id: TargetId) -> TargetChange {
        TargetChange {
            target_id,
            kind: TargetChangeKind::Current,
        }
    }

    fn target_of(engine: &SyncEngine, query_id: &str) -> TargetId {
        engine.queries[query_id].view.target_id
    }

    #[test]
    fn listen_shares_targets_between_equal_queries() {
        let (mut engine, _) = engine();
        let (first, result) = engine.listen(items()).unwrap();
        assert!(result.documents.is_empty());
        assert!(result.from_cache);
        let (second, _) = engine.listen(items()).unwrap();
        assert_eq!(first, second);

        let effects = engine.take_effects();
        let adds = effects
            .messages
            .iter()
            .filter(|m| matches!(m, ClientMessage::AddTarget { .. }))
            .count();
        assert_eq!(adds, 1);

        engine.unlisten(&first);
        assert!(engine.take_effects().messages.is_empty());
        engine.unlisten(&first);
        assert!(matches!(
            engine.take_effects().messages.as_slice(),
            [ClientMessage::RemoveTarget { .. }]
        ));
        // Extra unlisten is a no-op.
        engine.unlisten(&first);
        assert!(engine.take_effects().is_empty());
    }

    #[test]
    fn invalid_query_is_rejected() {
        let (mut engine, _) = engine();
        let query = items()
            .filter("a", docsync_model::FilterOp::LessThan, 1)
            .filter("b", docsync_model::FilterOp::GreaterThan, 1);
        assert!(matches!(engine.listen(query), Err(SyncError::InvalidQuery(_))));
    }

    #[test]
    fn local_write_updates_views_before_sending() {
        let (mut engine, _) = engine();
        let (query_id, _) = engine.listen(items()).unwrap();
        engine.take_effects();

        let batch = engine
            .write(vec![Mutation::set(key("items/a"), fields(1))])
            .unwrap();
        let effects = engine.take_effects();
        assert_eq!(effects.views.len(), 1);
        let (id, result) = &effects.views[0];
        assert_eq!(id, &query_id);
        assert_eq!(result.documents.len(), 1);
        assert!(result.from_cache);
        assert!(result.has_pending_writes);
        assert!(matches!(
            effects.messages.as_slice(),
            [ClientMessage::Write { batch_id, .. }] if *batch_id == batch.batch_id
        ));
    }

    #[test]
    fn preconditions_are_checked_progressively() {
        let (mut engine, _) = engine();
        let a = key("items/a");
        let err = engine
            .write(vec![
                Mutation::set(a.clone(), fields(1)).with_precondition(Precondition::Exists(false)),
                Mutation::set(a.clone(), fields(2)).with_precondition(Precondition::Exists(false)),
            ])
            .unwrap_err();
        assert!(matches!(err, SyncError::PreconditionFailed { .. }));
        assert_eq!(engine.pending_count(), 0);

        engine
            .write(vec![
                Mutation::set(a.clone(), fields(1)).with_precondition(Precondition::Exists(false)),
                Mutation::patch(a.clone(), Default::default()),
            ])
            .unwrap();
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn empty_write_is_invalid() {
        let (mut engine, _) = engine();
        assert!(matches!(
            engine.write(Vec::new()),
            Err(SyncError::InvalidArgument(ModelError::EmptyBatch))
        ));
    }

    #[test]
    fn current_target_confirms_view() {
        let (mut engine, _) = engine();
        engine.on_connected();
        let (query_id, _) = engine.listen(items()).unwrap();
        let target = target_of(&engine, &query_id);
        engine.take_effects();

        engine
            .apply_server_message(changes(3, vec![found("items/a", 2, target)], vec![current(target)]))
            .unwrap();
        let effects = engine.take_effects();
        let (_, result) = effects.views.last().unwrap();
        assert_eq!(result.documents.len(), 1);
        assert!(!result.from_cache);
        assert!(engine.targets[&target].resume_token.is_some());
    }

    #[test]
    fn acknowledgment_clears_pending_flag_and_is_idempotent() {
        let (mut engine, _) = engine();
        engine.listen(items()).unwrap();
        let batch = engine
            .write(vec![Mutation::set(key("items/a"), fields(1))])
            .unwrap();
        engine.take_effects();

        let ack = ServerMessage {
            sequence: 1,
            body: ServerBody::WriteAck {
                batch_id: batch.batch_id,
                commit_version: SnapshotVersion::new(5),
            },
        };
        engine.apply_server_message(ack.clone()).unwrap();
        let effects = engine.take_effects();
        assert!(matches!(effects.write_results.as_slice(), [(_, Ok(v))] if v.as_u64() == 5));
        let (_, result) = effects.views.last().unwrap();
        assert!(!result.has_pending_writes);
        assert_eq!(result.documents[0].version, SnapshotVersion::new(5));

        engine.apply_server_message(ack).unwrap();
        assert!(engine.take_effects().is_empty());
    }

    #[test]
    fn rejection_rolls_back_only_that_batch() {
        let (mut engine, _) = engine();
        engine.listen(items()).unwrap();
        let first = engine
            .write(vec![Mutation::set(key("items/a"), fields(1))])
            .unwrap();
        engine
            .write(vec![Mutation::set(key("items/b"), fields(2))])
            .unwrap();
        engine.take_effects();

        let reject = ServerMessage {
            sequence: 1,
            body: ServerBody::WriteRejected {
                batch_id: first.batch_id,
                code: "permission-denied".into(),
                message: "no".into(),
            },
        };
        engine.apply_server_message(reject.clone()).unwrap();
        let effects = engine.take_effects();
        assert!(matches!(
            effects.write_results.as_slice(),
            [(_, Err(SyncError::Rejected { .. }))]
        ));
        let (_, result) = effects.views.last().unwrap();
        let ids: Vec<&str> = result.documents.iter().map(|d| d.key.id()).collect();
        assert_eq!(ids, vec!["b"]);

        engine.apply_server_message(reject).unwrap();
        assert!(engine.take_effects().is_empty());
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn stale_checkpoint_is_a_protocol_gap() {
        let (mut engine, _) = engine();
        engine.apply_server_message(changes(10, vec![], vec![])).unwrap();
        let err = engine.apply_server_message(changes(4, vec![], vec![])).unwrap_err();
        assert!(matches!(
            err,
            SyncError::ProtocolGap {
                expected: 10,
                received: 4
            }
        ));
    }

    #[test]
    fn full_resync_after_gap_accepts_lower_checkpoint() {
        let (mut engine, _) = engine();
        engine.on_connected();
        let (query_id, _) = engine.listen(items()).unwrap();
        let target = target_of(&engine, &query_id);
        engine
            .apply_server_message(changes(
                10,
                vec![found("items/a", 10, target)],
                vec![current(target)],
            ))
            .unwrap();
        assert!(engine
            .apply_server_message(changes(4, vec![], vec![]))
            .is_err());

        engine.on_protocol_gap();
        engine.on_connected();
        engine.take_effects();
        engine
            .apply_server_message(changes(
                4,
                vec![found("items/a", 10, target)],
                vec![current(target)],
            ))
            .unwrap();
        assert_eq!(engine.store.checkpoint(), SnapshotVersion::new(4));
        let effects = engine.take_effects();
        let (_, result) = effects.views.last().unwrap();
        assert_eq!(result.documents.len(), 1);
        assert!(!result.from_cache);

        // Only the first batch of a re-sync may go backwards.
        let err = engine
            .apply_server_message(changes(3, vec![], vec![]))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::ProtocolGap {
                expected: 4,
                received: 3
            }
        ));
    }

    #[test]
    fn limbo_document_is_resolved_as_deleted() {
        let (mut engine, _) = engine();
        engine.on_connected();
        let (query_id, _) = engine.listen(items()).unwrap();
        let target = target_of(&engine, &query_id);

        // Cache knows a and b; the server only confirms a.
        engine
            .apply_server_message(changes(
                2,
                vec![found("items/a", 1, target), found("items/b", 1, TargetId::new(99))],
                vec![],
            ))
            .unwrap();
        engine.take_effects();
        engine
            .apply_server_message(changes(3, vec![], vec![current(target)]))
            .unwrap();

        let effects = engine.take_effects();
        assert!(effects.views.iter().all(|(_, result)| result.from_cache));
        let limbo_target = engine.limbo_targets[&key("items/b")];
        assert!(effects.messages.iter().any(|m| matches!(
            m,
            ClientMessage::AddTarget { target_id, .. } if *target_id == limbo_target
        )));

        // The limbo target goes current without the document.
        engine
            .apply_server_message(changes(3, vec![], vec![current(limbo_target)]))
            .unwrap();
        let effects = engine.take_effects();
        let (_, result) = effects.views.last().unwrap();
        let ids: Vec<&str> = result.documents.iter().map(|d| d.key.id()).collect();
        assert_eq!(ids, vec!["a"]);
        assert!(!result.from_cache);
        assert!(engine.limbo_targets.is_empty());
        assert!(effects.messages.iter().any(|m| matches!(
            m,
            ClientMessage::RemoveTarget { target_id } if *target_id == limbo_target
        )));
    }

    #[test]
    fn rejected_listen_reports_error_once() {
        let (mut engine, _) = engine();
        let (query_id, _) = engine.listen(items()).unwrap();
        let target = target_of(&engine, &query_id);
        engine.take_effects();

        engine
            .apply_server_message(changes(
                1,
                vec![],
                vec![TargetChange {
                    target_id: target,
                    kind: TargetChangeKind::Removed {
                        code: "permission-denied".into(),
                        message: "no access".into(),
                    },
                }],
            ))
            .unwrap();
        let effects = engine.take_effects();
        assert!(matches!(
            effects.listen_errors.as_slice(),
            [(id, SyncError::ListenRejected { .. })] if id == &query_id
        ));
        engine.unlisten(&query_id);
        assert!(engine.take_effects().messages.is_empty());
    }

    #[test]
    fn reconnect_redeclares_targets_and_resends_batches() {
        let (mut engine, _) = engine();
        engine.on_connected();
        let (query_id, _) = engine.listen(items()).unwrap();
        let target = target_of(&engine, &query_id);
        engine
            .apply_server_message(changes(2, vec![], vec![current(target)]))
            .unwrap();
        engine
            .write(vec![Mutation::set(key("items/a"), fields(1))])
            .unwrap();
        engine.on_disconnected();
        engine.take_effects();

        engine.on_connected();
        let effects = engine.take_effects();
        assert!(matches!(effects.messages[0], ClientMessage::Handshake { .. }));
        assert!(effects.messages.iter().any(|m| matches!(
            m,
            ClientMessage::AddTarget { resume_token: Some(_), .. }
        )));
        assert!(matches!(effects.messages.last(), Some(ClientMessage::Write { .. })));

        engine.on_protocol_gap();
        engine.take_effects();
        engine.on_connected();
        let effects = engine.take_effects();
        assert!(effects.messages.iter().any(|m| matches!(
            m,
            ClientMessage::AddTarget { resume_token: None, .. }
        )));
    }

    #[test]
    fn persistence_failure_halts() {
        let (mut engine, persistence) = engine();
        persistence.fail_commits(true);
        let err = engine
            .write(vec![Mutation::set(key("items/a"), fields(1))])
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(engine.is_halted());
        assert!(engine.take_effects().fatal.is_some());

        persistence.fail_commits(false);
        assert!(matches!(
            engine.write(vec![Mutation::set(key("items/a"), fields(1))]),
            Err(SyncError::Halted)
        ));
    }
}
