//! Listener handles: callback registrations and pull-based snapshot streams.

use crate::client::Command;
use crate::error::{SyncError, SyncResult};
use crate::snapshot::ViewSnapshot;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// What a listener receives: a snapshot, or the error that ended it.
pub type SnapshotEvent = SyncResult<ViewSnapshot>;

/// Options for a listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also deliver snapshots whose only change is metadata
    /// (`from_cache` or pending-write state).
    pub include_metadata_changes: bool,
}

impl ListenOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether metadata-only changes are delivered.
    pub fn with_metadata_changes(mut self, include: bool) -> Self {
        self.include_metadata_changes = include;
        self
    }
}

type Callback = Box<dyn FnMut(SnapshotEvent) + Send>;

/// Delivery target of one listener.
///
/// Every delivery runs under `gate`, and deactivation takes the same gate,
/// so once [`ListenerSlot::deactivate`] returns no callback is running or
/// will run. The gate is reentrant so a callback may remove its own
/// listener.
pub(crate) struct ListenerSlot {
    active: AtomicBool,
    gate: ReentrantMutex<()>,
    callback: Mutex<Callback>,
}

impl ListenerSlot {
    pub(crate) fn new(callback: impl FnMut(SnapshotEvent) + Send + 'static) -> Self {
        Self {
            active: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
            callback: Mutex::new(Box::new(callback)),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deliver(&self, event: SnapshotEvent) {
        let _gate = self.gate.lock();
        if !self.is_active() {
            return;
        }
        let mut callback = self.callback.lock();
        (callback)(event);
    }

    pub(crate) fn deactivate(&self) {
        let _gate = self.gate.lock();
        self.active.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Handle of a callback listener.
///
/// Dropping the registration does not stop the listener; call
/// [`ListenerRegistration::remove`].
#[derive(Debug)]
pub struct ListenerRegistration {
    listener_id: u64,
    slot: Arc<ListenerSlot>,
    commands: mpsc::UnboundedSender<Command>,
    removed: AtomicBool,
}

impl ListenerRegistration {
    pub(crate) fn new(
        listener_id: u64,
        slot: Arc<ListenerSlot>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            listener_id,
            slot,
            commands,
            removed: AtomicBool::new(false),
        }
    }

    /// Stops the listener.
    ///
    /// Idempotent. Once this returns the callback is never invoked again,
    /// even if a delivery was running on another thread. May be called from
    /// inside the callback.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slot.deactivate();
        let _ = self.commands.send(Command::Unlisten {
            listener_id: self.listener_id,
        });
    }

    /// Returns true until the listener is removed or fails.
    pub fn is_active(&self) -> bool {
        !self.removed.load(Ordering::SeqCst) && self.slot.is_active()
    }
}

#[derive(Debug, Default)]
struct StreamQueue {
    events: VecDeque<SnapshotEvent>,
    closed: bool,
}

#[derive(Debug)]
struct StreamShared {
    queue: Mutex<StreamQueue>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl StreamShared {
    fn push(&self, event: SnapshotEvent) {
        {
            let mut queue = self.queue.lock();
            if queue.closed {
                return;
            }
            if queue.events.len() >= self.capacity {
                queue.events.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    capacity = self.capacity,
                    dropped,
                    "snapshot stream full, dropping oldest snapshot"
                );
            }
            queue.closed = event.is_err();
            queue.events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.queue.lock().closed = true;
        self.notify.notify_one();
    }
}

/// A pull-based listener with a bounded queue.
///
/// When the consumer falls behind, the oldest queued snapshot is dropped.
/// The stream ends after an error has been delivered. Dropping the stream
/// stops the listener.
#[derive(Debug)]
pub struct SnapshotStream {
    shared: Arc<StreamShared>,
    registration: ListenerRegistration,
}

impl SnapshotStream {
    /// Builds the stream's callback and shared queue.
    pub(crate) fn channel(
        capacity: usize,
    ) -> (
        impl FnMut(SnapshotEvent) + Send + 'static,
        impl FnOnce(ListenerRegistration) -> SnapshotStream,
    ) {
        let shared = Arc::new(StreamShared {
            queue: Mutex::new(StreamQueue::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        });
        let sink = Arc::clone(&shared);
        let callback = move |event: SnapshotEvent| sink.push(event);
        let build = move |registration| SnapshotStream {
            shared,
            registration,
        };
        (callback, build)
    }

    /// Waits for the next event. Returns `None` once the stream has ended
    /// and every queued event has been taken.
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        loop {
            {
                let mut queue = self.shared.queue.lock();
                if let Some(event) = queue.events.pop_front() {
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Like [`SnapshotStream::next`], giving up after `timeout`.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<SnapshotEvent> {
        tokio::time::timeout(timeout, self.next())
            .await
            .ok()
            .flatten()
    }

    /// Takes a queued event without waiting.
    pub fn try_next(&mut self) -> Option<SnapshotEvent> {
        self.shared.queue.lock().events.pop_front()
    }

    /// Number of snapshots dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Returns true if the stream will not receive more events.
    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Stops the listener. Queued events can still be taken.
    pub fn close(&self) {
        self.registration.remove();
        self.shared.close();
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        self.registration.remove();
    }
}

/// Fails a freshly created listener that never reached the engine.
pub(crate) fn reject_listener(slot: &ListenerSlot, error: SyncError) {
    slot.deliver(Err(error));
    slot.deactivate();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::QueryResult;
    use docsync_model::Query;
    use std::sync::atomic::AtomicUsize;

    fn snapshot() -> ViewSnapshot {
        ViewSnapshot::initial(QueryResult {
            query: Query::collection("items").unwrap(),
            documents: Vec::new(),
            from_cache: true,
            has_pending_writes: false,
        })
    }

    fn registration(slot: Arc<ListenerSlot>) -> (ListenerRegistration, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ListenerRegistration::new(7, slot, tx), rx)
    }

    #[test]
    fn remove_is_idempotent_and_stops_delivery() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slot = Arc::new(ListenerSlot::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let (registration, mut commands) = registration(Arc::clone(&slot));

        slot.deliver(Ok(snapshot()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registration.remove();
        registration.remove();
        assert!(!registration.is_active());
        slot.deliver(Ok(snapshot()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(matches!(commands.try_recv(), Ok(Command::Unlisten { listener_id: 7 })));
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn callback_can_remove_itself() {
        let holder: Arc<Mutex<Option<ListenerRegistration>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&holder);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slot = Arc::new(ListenerSlot::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(registration) = inner.lock().as_ref() {
                registration.remove();
            }
        }));
        let (registration, _commands) = registration(Arc::clone(&slot));
        *holder.lock() = Some(registration);

        slot.deliver(Ok(snapshot()));
        slot.deliver(Ok(snapshot()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_waits_for_in_flight_delivery() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let finished = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&finished);
        let slot = Arc::new(ListenerSlot::new(move |_| {
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            done.store(true, Ordering::SeqCst);
        }));
        let (registration, _commands) = registration(Arc::clone(&slot));

        let delivering = Arc::clone(&slot);
        let worker = std::thread::spawn(move || delivering.deliver(Ok(snapshot())));
        entered_rx.recv().unwrap();

        let remover = std::thread::spawn(move || {
            registration.remove();
            registration
        });
        std::thread::sleep(Duration::from_millis(20));
        release_tx.send(()).unwrap();
        let _registration = remover.join().unwrap();
        // remove() could only return after the callback finished.
        assert!(finished.load(Ordering::SeqCst));
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn stream_drops_oldest_on_overflow() {
        let (mut callback, build) = SnapshotStream::channel(2);
        let slot = Arc::new(ListenerSlot::new(|_| {}));
        let (registration, _commands) = registration(slot);
        let mut stream = build(registration);

        for _ in 0..5 {
            callback(Ok(snapshot()));
        }
        assert_eq!(stream.dropped(), 3);
        assert!(stream.try_next().is_some());
        assert!(stream.next_timeout(Duration::from_millis(10)).await.is_some());
        assert!(stream.next_timeout(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn stream_ends_after_error() {
        let (mut callback, build) = SnapshotStream::channel(4);
        let slot = Arc::new(ListenerSlot::new(|_| {}));
        let (registration, _commands) = registration(slot);
        let mut stream = build(registration);

        callback(Ok(snapshot()));
        callback(Err(SyncError::ClientShutdown));
        callback(Ok(snapshot()));
        assert!(matches!(stream.next().await, Some(Ok(_))));
        assert!(matches!(stream.next().await, Some(Err(SyncError::ClientShutdown))));
        assert!(stream.next().await.is_none());
        assert!(stream.is_closed());
    }
}
