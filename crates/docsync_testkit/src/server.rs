//! An authoritative in-memory backend.
//!
//! [`MemoryServer`] keeps the canonical documents, serves watch targets and
//! commits write batches the way a real backend would:
//!
//! - versions increase by one per committed batch
//! - resume tokens encode the version they were issued at
//! - writes are deduplicated by `(client_id, batch_id)`, so a re-sent batch
//!   gets the original outcome without being applied twice
//! - document changes are broadcast to every watching connection before the
//!   writer is acknowledged
//!
//! Limits are not applied server-side; clients trim results locally.
//!
//! Fault injection covers going offline, forced disconnects, rejected
//! writes, rejected listens and sequence gaps.

use docsync_engine::{
    ChangeBatch, ClientMessage, Connection, DocumentUpdate, ServerBody, ServerMessage, SyncError,
    SyncResult, TargetChange, TargetChangeKind,
};
use docsync_model::{
    BatchId, Document, DocumentKey, Existence, Fields, Mutation, Query, ResourcePath, ResumeToken,
    SnapshotVersion, TargetId,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum WriteOutcome {
    Committed(SnapshotVersion),
    Rejected { code: String, message: String },
}

#[derive(Debug)]
struct ServerTarget {
    query: Query,
    keys: BTreeSet<DocumentKey>,
}

#[derive(Debug)]
struct ConnectionState {
    client_id: Option<Uuid>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    sequence: u64,
    targets: BTreeMap<TargetId, ServerTarget>,
}

impl ConnectionState {
    fn send(&mut self, body: ServerBody) {
        self.sequence += 1;
        let _ = self.outbound.send(ServerMessage {
            sequence: self.sequence,
            body,
        });
    }
}

#[derive(Debug, Default)]
struct ServerState {
    version: u64,
    documents: BTreeMap<DocumentKey, Document>,
    connections: BTreeMap<u64, ConnectionState>,
    next_connection: u64,
    outcomes: HashMap<(Uuid, BatchId), WriteOutcome>,
    offline: bool,
    reject_next: Option<(String, String)>,
    denied: HashSet<ResourcePath>,
    writes_applied: u64,
    writes_received: u64,
}

/// In-memory backend shared by any number of clients.
///
/// Cloning yields another handle to the same server.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a new watch connection.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a retryable transport error while the server is offline.
    pub fn accept(&self) -> SyncResult<Connection> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(SyncError::transport_retryable("server offline"));
        }
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (server_tx, server_rx) = mpsc::unbounded_channel::<ServerMessage>();

        state.next_connection += 1;
        let connection_id = state.next_connection;
        state.connections.insert(
            connection_id,
            ConnectionState {
                client_id: None,
                outbound: server_tx,
                sequence: 0,
                targets: BTreeMap::new(),
            },
        );
        drop(state);

        let server = self.clone();
        tokio::spawn(async move {
            while let Some(message) = client_rx.recv().await {
                server.handle(connection_id, message);
            }
            server.state.lock().connections.remove(&connection_id);
        });
        tracing::debug!(connection_id, "server accepted connection");

        Ok(Connection {
            outbound: client_tx,
            inbound: server_rx,
        })
    }

    fn handle(&self, connection_id: u64, message: ClientMessage) {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&connection_id) {
            return;
        }
        match message {
            ClientMessage::Handshake { client_id } => {
                if let Some(connection) = state.connections.get_mut(&connection_id) {
                    connection.client_id = Some(client_id);
                }
            }
            ClientMessage::AddTarget {
                target_id,
                query,
                resume_token,
            } => state.add_target(connection_id, target_id, query, resume_token),
            ClientMessage::RemoveTarget { target_id } => {
                if let Some(connection) = state.connections.get_mut(&connection_id) {
                    connection.targets.remove(&target_id);
                }
            }
            ClientMessage::Write {
                batch_id,
                mutations,
            } => state.write(connection_id, batch_id, mutations),
        }
    }

    /// Takes the server offline (dropping every connection) or back online.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.state.lock();
        state.offline = offline;
        if offline {
            state.connections.clear();
        }
        tracing::debug!(offline, "server availability changed");
    }

    /// Drops every open connection. Clients reconnect after their backoff.
    pub fn disconnect_all(&self) {
        self.state.lock().connections.clear();
    }

    /// Makes the next message on every open connection skip one sequence
    /// number.
    pub fn inject_sequence_gap(&self) {
        for connection in self.state.lock().connections.values_mut() {
            connection.sequence += 1;
        }
    }

    /// Rejects the next new (non-duplicate) write batch.
    pub fn reject_next_write(&self, code: impl Into<String>, message: impl Into<String>) {
        self.state.lock().reject_next = Some((code.into(), message.into()));
    }

    /// Refuses every listen on `path` with `permission-denied`.
    pub fn deny_listens(&self, path: &ResourcePath) {
        self.state.lock().denied.insert(path.clone());
    }

    /// Writes a document directly on the server, as another client would.
    pub fn write_direct(&self, key: &DocumentKey, fields: Fields) -> SnapshotVersion {
        self.commit_direct(Mutation::set(key.clone(), fields))
    }

    /// Deletes a document directly on the server.
    pub fn delete_direct(&self, key: &DocumentKey) -> SnapshotVersion {
        self.commit_direct(Mutation::delete(key.clone()))
    }

    fn commit_direct(&self, mutation: Mutation) -> SnapshotVersion {
        let mut state = self.state.lock();
        let version = state.commit(&[mutation]);
        state.writes_applied += 1;
        version
    }

    /// The committed state of a document, if it exists.
    pub fn document(&self, key: &DocumentKey) -> Option<Document> {
        self.state
            .lock()
            .documents
            .get(key)
            .filter(|doc| doc.exists())
            .cloned()
    }

    /// Current server version.
    pub fn version(&self) -> SnapshotVersion {
        SnapshotVersion::new(self.state.lock().version)
    }

    /// Number of write batches actually applied (duplicates excluded).
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes_applied
    }

    /// Number of write messages received, duplicates included.
    pub fn writes_received(&self) -> u64 {
        self.state.lock().writes_received
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

impl ServerState {
    fn token(&self) -> ResumeToken {
        ResumeToken::new(self.version.to_be_bytes().to_vec())
    }

    fn add_target(
        &mut self,
        connection_id: u64,
        target_id: TargetId,
        query: Query,
        resume_token: Option<ResumeToken>,
    ) {
        let version = SnapshotVersion::new(self.version);
        if self.denied.contains(&query.path) {
            if let Some(connection) = self.connections.get_mut(&connection_id) {
                connection.send(ServerBody::Changes(ChangeBatch {
                    snapshot_version: version,
                    resume_token: ResumeToken::default(),
                    documents: Vec::new(),
                    target_changes: vec![TargetChange {
                        target_id,
                        kind: TargetChangeKind::Removed {
                            code: "permission-denied".into(),
                            message: format!("listen on {} is not allowed", query.path),
                        },
                    }],
                }));
            }
            return;
        }

        let since = resume_token
            .as_ref()
            .and_then(|token| <[u8; 8]>::try_from(token.as_bytes()).ok())
            .map_or(0, u64::from_be_bytes);

        let mut keys = BTreeSet::new();
        let mut documents = Vec::new();
        for doc in self.documents.values().filter(|doc| in_scope(&query, &doc.key)) {
            let matches = query.matches(doc);
            if matches {
                keys.insert(doc.key.clone());
            }
            let changed = since == 0 || doc.version.as_u64() > since;
            if !changed || (since == 0 && !matches) {
                continue;
            }
            documents.push(DocumentUpdate {
                document: doc.clone(),
                added_to: if matches { vec![target_id] } else { Vec::new() },
                removed_from: if matches { Vec::new() } else { vec![target_id] },
            });
        }

        let token = self.token();
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        connection
            .targets
            .insert(target_id, ServerTarget { query, keys });
        connection.send(ServerBody::Changes(ChangeBatch {
            snapshot_version: version,
            resume_token: token,
            documents,
            target_changes: vec![
                TargetChange {
                    target_id,
                    kind: TargetChangeKind::Added,
                },
                TargetChange {
                    target_id,
                    kind: TargetChangeKind::Current,
                },
            ],
        }));
    }

    fn write(&mut self, connection_id: u64, batch_id: BatchId, mutations: Vec<Mutation>) {
        self.writes_received += 1;
        let client_id = self
            .connections
            .get(&connection_id)
            .and_then(|c| c.client_id)
            .unwrap_or_else(Uuid::nil);

        let previous = self.outcomes.get(&(client_id, batch_id)).cloned();
        let outcome = match previous {
            Some(outcome) => {
                tracing::debug!(%client_id, %batch_id, "duplicate write, replaying outcome");
                outcome
            }
            None => {
                let outcome = if let Some((code, message)) = self.reject_next.take() {
                    WriteOutcome::Rejected { code, message }
                } else if let Some(key) = self.failed_precondition(&mutations) {
                    WriteOutcome::Rejected {
                        code: "failed-precondition".into(),
                        message: format!("precondition failed for {key}"),
                    }
                } else {
                    self.writes_applied += 1;
                    WriteOutcome::Committed(self.commit(&mutations))
                };
                self.outcomes.insert((client_id, batch_id), outcome.clone());
                outcome
            }
        };

        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        let body = match outcome {
            WriteOutcome::Committed(commit_version) => ServerBody::WriteAck {
                batch_id,
                commit_version,
            },
            WriteOutcome::Rejected { code, message } => ServerBody::WriteRejected {
                batch_id,
                code,
                message,
            },
        };
        connection.send(body);
    }

    fn failed_precondition(&self, mutations: &[Mutation]) -> Option<DocumentKey> {
        let mut overlay: HashMap<&DocumentKey, Option<Document>> = HashMap::new();
        for mutation in mutations {
            let base = match overlay.get(&mutation.key) {
                Some(doc) => doc.clone(),
                None => self.documents.get(&mutation.key).cloned(),
            };
            if !mutation.precondition.is_valid_for_authoritative(base.as_ref()) {
                return Some(mutation.key.clone());
            }
            let next = mutation.apply_to_remote(base, SnapshotVersion::new(self.version + 1));
            overlay.insert(&mutation.key, Some(next));
        }
        None
    }

    /// Applies mutations at a new version and broadcasts the changes.
    fn commit(&mut self, mutations: &[Mutation]) -> SnapshotVersion {
        self.version += 1;
        let version = SnapshotVersion::new(self.version);

        let mut changed: BTreeMap<DocumentKey, Document> = BTreeMap::new();
        for mutation in mutations {
            let base = changed
                .get(&mutation.key)
                .or_else(|| self.documents.get(&mutation.key))
                .cloned();
            let mut doc = mutation.apply_to_remote(base, version);
            if doc.existence == Existence::Unknown {
                doc.existence = Existence::Exists;
            }
            changed.insert(doc.key.clone(), doc);
        }
        self.documents
            .extend(changed.iter().map(|(key, doc)| (key.clone(), doc.clone())));
        self.broadcast(version, changed.values());
        version
    }

    fn broadcast<'a>(&mut self, version: SnapshotVersion, changed: impl Iterator<Item = &'a Document> + Clone) {
        let token = self.token();
        for connection in self.connections.values_mut() {
            let mut updates = Vec::new();
            for doc in changed.clone() {
                let mut update = DocumentUpdate {
                    document: doc.clone(),
                    added_to: Vec::new(),
                    removed_from: Vec::new(),
                };
                for (target_id, target) in &mut connection.targets {
                    if !in_scope(&target.query, &doc.key) {
                        continue;
                    }
                    if target.query.matches(doc) {
                        target.keys.insert(doc.key.clone());
                        update.added_to.push(*target_id);
                    } else if target.keys.remove(&doc.key) {
                        update.removed_from.push(*target_id);
                    }
                }
                if !update.added_to.is_empty() || !update.removed_from.is_empty() {
                    updates.push(update);
                }
            }
            if !updates.is_empty() {
                connection.send(ServerBody::Changes(ChangeBatch {
                    snapshot_version: version,
                    resume_token: token.clone(),
                    documents: updates,
                    target_changes: Vec::new(),
                }));
            }
        }
    }
}

/// Returns true if `key` could belong to the query's result set.
fn in_scope(query: &Query, key: &DocumentKey) -> bool {
    if query.is_document_query() {
        key.path() == &query.path
    } else {
        query.path.is_immediate_parent_of(key.path())
    }
}
