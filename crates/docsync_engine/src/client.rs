//! The client handle and its engine loop.
//!
//! [`Client::open`] spawns one tokio task that owns the [`SyncEngine`], the
//! watch stream and every listener. Client methods talk to it over a
//! command channel; stream tasks post events to it over a second channel.
//! The loop handles one command or event at a time, so engine transitions
//! never interleave.

use crate::config::ClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::event_manager::EventManager;
use crate::listener::{
    reject_listener, ListenOptions, ListenerRegistration, ListenerSlot, SnapshotEvent,
    SnapshotStream,
};
use crate::protocol::ServerBody;
use crate::snapshot::{DocumentSnapshot, ViewSnapshot};
use crate::sync_engine::SyncEngine;
use crate::transport::Connector;
use crate::view::QueryResult;
use crate::watch_stream::{StreamEvent, StreamOutcome, StreamState, WatchStream};
use docsync_model::{
    BatchId, DocumentKey, Fields, Mutation, Patch, Precondition, Query, SnapshotVersion,
};
use docsync_store::{LocalStore, Persistence};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Where a read is served from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Source {
    /// Wait for a server-confirmed result while the stream is reachable,
    /// otherwise (or on timeout) answer from the local cache.
    #[default]
    Default,
    /// Require a server-confirmed result.
    Server,
    /// Answer from the local cache only.
    Cache,
}

/// Requests from client handles to the engine loop.
pub(crate) enum Command {
    Write {
        mutations: Vec<Mutation>,
        reply: oneshot::Sender<SyncResult<BatchId>>,
        committed: oneshot::Sender<SyncResult<SnapshotVersion>>,
    },
    Listen {
        listener_id: u64,
        query: Query,
        options: ListenOptions,
        slot: Arc<ListenerSlot>,
    },
    Unlisten {
        listener_id: u64,
    },
    Peek {
        query: Query,
        reply: oneshot::Sender<SyncResult<QueryResult>>,
    },
    WaitForPendingWrites {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A write that has been applied locally and is waiting for the server.
#[derive(Debug)]
pub struct PendingWrite {
    batch_id: BatchId,
    committed: oneshot::Receiver<SyncResult<SnapshotVersion>>,
}

impl PendingWrite {
    /// The batch id of the write.
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Waits for the server's verdict: the commit version, or `Rejected`.
    ///
    /// Resolves with `ClientShutdown` if the client shuts down first; the
    /// batch stays queued and is sent again by the next client opened on
    /// the same persistence.
    pub async fn committed(self) -> SyncResult<SnapshotVersion> {
        self.committed
            .await
            .unwrap_or_else(|_| Err(SyncError::ClientShutdown))
    }
}

/// Handle to a running sync client.
///
/// Cheap to share behind an `Arc`; every method may be called from any
/// task.
#[derive(Debug)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<StreamState>,
    fatal: broadcast::Sender<SyncError>,
    config: ClientConfig,
    client_id: Uuid,
    next_listener_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Opens the local store and starts the engine loop.
    ///
    /// The watch stream connects on the first listener or write, or right
    /// away if writes from an earlier session are still pending.
    pub async fn open(
        config: ClientConfig,
        persistence: Arc<dyn Persistence>,
        connector: Arc<dyn Connector>,
    ) -> SyncResult<Self> {
        let store = LocalStore::open(Arc::clone(&persistence))?;
        let engine = SyncEngine::new(store);
        let client_id = engine.client_id();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(StreamState::Disconnected);
        let (fatal_tx, _) = broadcast::channel(16);

        let mut stream = WatchStream::new(connector, config.backoff.clone(), events_tx);
        if engine.has_pending_writes() {
            tracing::info!(pending = engine.pending_count(), "pending writes found, connecting");
            stream.ensure_started();
        }

        let engine_loop = EngineLoop {
            engine,
            stream,
            events: EventManager::new(),
            commits: HashMap::new(),
            flush_waiters: Vec::new(),
            state: state_tx,
            fatal: fatal_tx.clone(),
            persistence,
        };
        let task = tokio::spawn(engine_loop.run(commands_rx, events_rx));
        tracing::info!(%client_id, "client opened");

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            fatal: fatal_tx,
            config,
            client_id,
            next_listener_id: AtomicU64::new(1),
            task: Mutex::new(Some(task)),
        })
    }

    /// The persistent identity of this client.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Current watch stream state.
    pub fn stream_state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Receiver of watch stream state changes.
    pub fn stream_states(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    /// Receiver of fatal engine errors. After one is published, writes
    /// fail with `Halted`.
    pub fn fatal_errors(&self) -> broadcast::Receiver<SyncError> {
        self.fatal.subscribe()
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::ClientShutdown)
    }

    /// Writes a whole document, replacing any existing contents.
    pub async fn set(&self, key: &DocumentKey, fields: Fields) -> SyncResult<PendingWrite> {
        self.write_batch(vec![Mutation::set(key.clone(), fields)])
            .await
    }

    /// Writes a whole document if `precondition` holds locally.
    pub async fn set_with_precondition(
        &self,
        key: &DocumentKey,
        fields: Fields,
        precondition: Precondition,
    ) -> SyncResult<PendingWrite> {
        self.write_batch(vec![
            Mutation::set(key.clone(), fields).with_precondition(precondition)
        ])
        .await
    }

    /// Changes individual fields of an existing document.
    pub async fn update(&self, key: &DocumentKey, patch: Patch) -> SyncResult<PendingWrite> {
        self.write_batch(vec![Mutation::patch(key.clone(), patch)])
            .await
    }

    /// Deletes a document.
    pub async fn delete(&self, key: &DocumentKey) -> SyncResult<PendingWrite> {
        self.write_batch(vec![Mutation::delete(key.clone())]).await
    }

    /// Writes several mutations atomically.
    ///
    /// Resolves once the batch is durably queued and visible to local
    /// listeners, or fails with `PreconditionFailed` without queueing
    /// anything.
    pub async fn write_batch(&self, mutations: Vec<Mutation>) -> SyncResult<PendingWrite> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (committed_tx, committed_rx) = oneshot::channel();
        self.send(Command::Write {
            mutations,
            reply: reply_tx,
            committed: committed_tx,
        })?;
        let batch_id = reply_rx.await.map_err(|_| SyncError::ClientShutdown)??;
        Ok(PendingWrite {
            batch_id,
            committed: committed_rx,
        })
    }

    /// Reads one document.
    pub async fn get(&self, key: &DocumentKey, source: Source) -> SyncResult<DocumentSnapshot> {
        let snapshot = self.get_query(Query::document(key), source).await?;
        Ok(snapshot.document_snapshot(key))
    }

    /// Runs a query once.
    ///
    /// With [`Source::Default`] this waits up to `get_timeout` for a
    /// server-confirmed result and otherwise falls back to the cache. With
    /// [`Source::Server`] an unreachable server is `NetworkUnavailable` and
    /// a slow one is `Timeout`.
    pub async fn get_query(&self, query: Query, source: Source) -> SyncResult<ViewSnapshot> {
        query.validate().map_err(SyncError::InvalidQuery)?;
        if source == Source::Cache || !self.server_reachable() {
            return match source {
                Source::Server => Err(SyncError::NetworkUnavailable),
                _ => self.peek(query).await,
            };
        }

        let mut stream = self.listen_with_options(
            query.clone(),
            ListenOptions::new().with_metadata_changes(true),
        )?;
        let mut states = self.state.clone();
        let deadline = tokio::time::sleep(self.config.get_timeout);
        tokio::pin!(deadline);

        let fallback = loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(snapshot)) if !snapshot.from_cache() => return Ok(snapshot),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err),
                    None => return Err(SyncError::ClientShutdown),
                },
                changed = states.changed() => {
                    if changed.is_err() {
                        return Err(SyncError::ClientShutdown);
                    }
                    if !states.borrow().is_reachable() {
                        break SyncError::NetworkUnavailable;
                    }
                }
                () = &mut deadline => break SyncError::Timeout,
            }
        };
        drop(stream);

        tracing::debug!(query = %query.canonical_id(), reason = %fallback, "server read unavailable");
        match source {
            Source::Server => Err(fallback),
            _ => self.peek(query).await,
        }
    }

    fn server_reachable(&self) -> bool {
        self.state.borrow().is_reachable()
    }

    async fn peek(&self, query: Query) -> SyncResult<ViewSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Peek {
            query,
            reply: reply_tx,
        })?;
        let result = reply_rx.await.map_err(|_| SyncError::ClientShutdown)??;
        Ok(ViewSnapshot::initial(result))
    }

    /// Listens to a query with a callback.
    ///
    /// The callback first receives the current local result, then every
    /// change. It runs on the engine task and must not block.
    pub fn on_snapshot<F>(
        &self,
        query: Query,
        options: ListenOptions,
        callback: F,
    ) -> SyncResult<ListenerRegistration>
    where
        F: FnMut(SnapshotEvent) + Send + 'static,
    {
        query.validate().map_err(SyncError::InvalidQuery)?;
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ListenerSlot::new(callback));
        self.send(Command::Listen {
            listener_id,
            query,
            options,
            slot: Arc::clone(&slot),
        })?;
        Ok(ListenerRegistration::new(
            listener_id,
            slot,
            self.commands.clone(),
        ))
    }

    /// Listens to a single document.
    pub fn on_document_snapshot<F>(
        &self,
        key: &DocumentKey,
        options: ListenOptions,
        mut callback: F,
    ) -> SyncResult<ListenerRegistration>
    where
        F: FnMut(SyncResult<DocumentSnapshot>) + Send + 'static,
    {
        let key = key.clone();
        self.on_snapshot(Query::document(&key), options, move |event| {
            callback(event.map(|snapshot| snapshot.document_snapshot(&key)));
        })
    }

    /// Listens to a query through a bounded [`SnapshotStream`].
    pub fn listen(&self, query: Query) -> SyncResult<SnapshotStream> {
        self.listen_with_options(query, ListenOptions::new())
    }

    /// Like [`Client::listen`], with options.
    pub fn listen_with_options(
        &self,
        query: Query,
        options: ListenOptions,
    ) -> SyncResult<SnapshotStream> {
        let (callback, build) = SnapshotStream::channel(self.config.listener_capacity);
        let registration = self.on_snapshot(query, options, callback)?;
        Ok(build(registration))
    }

    /// Waits until every write queued so far has been acknowledged or
    /// rejected.
    pub async fn wait_for_pending_writes(&self) -> SyncResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::WaitForPendingWrites { reply: reply_tx })?;
        reply_rx.await.map_err(|_| SyncError::ClientShutdown)?
    }

    /// Shuts the client down.
    ///
    /// Waits up to `shutdown_flush_timeout` for pending writes, then
    /// releases every target, closes the stream and flushes persistence.
    /// Pending writes that were not acknowledged stay queued on disk.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let Some(task) = self.task.lock().take() else {
            return Ok(());
        };
        let flush = tokio::time::timeout(
            self.config.shutdown_flush_timeout,
            self.wait_for_pending_writes(),
        )
        .await;
        if !matches!(flush, Ok(Ok(()))) {
            tracing::debug!("shutting down with writes still pending");
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "engine task ended abnormally");
        }
        tracing::info!(client_id = %self.client_id, "client shut down");
        Ok(())
    }
}

struct EngineLoop {
    engine: SyncEngine,
    stream: WatchStream,
    events: EventManager,
    commits: HashMap<BatchId, oneshot::Sender<SyncResult<SnapshotVersion>>>,
    flush_waiters: Vec<oneshot::Sender<SyncResult<()>>>,
    state: watch::Sender<StreamState>,
    fatal: broadcast::Sender<SyncError>,
    persistence: Arc<dyn Persistence>,
}

impl EngineLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut stream_events: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        self.publish_state();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("all client handles dropped");
                        self.shutdown();
                        return;
                    }
                },
                Some(event) = stream_events.recv() => self.handle_stream_event(event),
            }
            self.flush_effects();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Write {
                mutations,
                reply,
                committed,
            } => {
                let result = self.engine.write(mutations);
                if let Ok(batch) = &result {
                    self.commits.insert(batch.batch_id, committed);
                }
                // Local listeners see the write before the caller resumes.
                self.flush_effects();
                let _ = reply.send(result.map(|batch| batch.batch_id));
            }
            Command::Listen {
                listener_id,
                query,
                options,
                slot,
            } => match self.engine.listen(query) {
                Ok((query_id, result)) => {
                    self.events.add(listener_id, query_id, slot, options, result);
                }
                Err(err) => reject_listener(&slot, err),
            },
            Command::Unlisten { listener_id } => {
                if let Some(query_id) = self.events.remove(listener_id) {
                    self.engine.unlisten(&query_id);
                }
            }
            Command::Peek { query, reply } => {
                let _ = reply.send(self.engine.peek(&query));
            }
            Command::WaitForPendingWrites { reply } => {
                if self.engine.is_halted() {
                    let _ = reply.send(Err(SyncError::Halted));
                } else if !self.engine.has_pending_writes() {
                    let _ = reply.send(Ok(()));
                } else {
                    self.flush_waiters.push(reply);
                }
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn handle_stream_event(&mut self, event: StreamEvent) {
        match self.stream.handle_event(event) {
            StreamOutcome::Ignored => {}
            StreamOutcome::Opened => self.engine.on_connected(),
            StreamOutcome::Message(message) => {
                let is_changes = matches!(message.body, ServerBody::Changes(_));
                // Persistence failures surface through the fatal effect.
                match self.engine.apply_server_message(message) {
                    Ok(()) if is_changes => self.stream.confirm_synced(),
                    Err(SyncError::ProtocolGap { expected, received }) => {
                        tracing::warn!(expected, received, "checkpoint went backwards, re-syncing");
                        self.stream.reconnect();
                        self.engine.on_protocol_gap();
                    }
                    _ => {}
                }
            }
            StreamOutcome::Interrupted => self.engine.on_disconnected(),
            StreamOutcome::Gap { .. } => self.engine.on_protocol_gap(),
        }
    }

    fn flush_effects(&mut self) {
        let effects = self.engine.take_effects();

        for message in effects.messages {
            if self.stream.is_open() {
                self.stream.send(message);
            } else {
                // Everything is re-declared once the stream opens.
                self.stream.ensure_started();
            }
        }
        for (query_id, result) in effects.views {
            self.events.on_view(&query_id, result);
        }
        for (query_id, error) in effects.listen_errors {
            self.events.on_listen_error(&query_id, &error);
        }
        for (batch_id, result) in effects.write_results {
            if let Some(committed) = self.commits.remove(&batch_id) {
                let _ = committed.send(result);
            }
        }
        if let Some(error) = effects.fatal {
            let _ = self.fatal.send(error.clone());
            for (_, committed) in self.commits.drain() {
                let _ = committed.send(Err(error.clone()));
            }
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        if !self.flush_waiters.is_empty() && !self.engine.has_pending_writes() {
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let state = self.stream.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn shutdown(&mut self) {
        tracing::debug!(
            listeners = self.events.len(),
            pending = self.engine.pending_count(),
            "stopping engine loop"
        );
        self.engine.release_all();
        let effects = self.engine.take_effects();
        for message in effects.messages {
            self.stream.send(message);
        }
        self.stream.shutdown();
        if let Err(err) = self.persistence.flush() {
            tracing::warn!(error = %err, "persistence flush failed during shutdown");
        }
        for (_, committed) in self.commits.drain() {
            let _ = committed.send(Err(SyncError::ClientShutdown));
        }
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(Err(SyncError::ClientShutdown));
        }
        self.events.close_all(&SyncError::ClientShutdown);
        self.publish_state();
    }
}
