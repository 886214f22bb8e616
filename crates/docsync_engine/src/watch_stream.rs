//! Watch stream connection state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Active -> Backoff -> Connecting -> ...
//!                     |                      ^
//!                     +----------------------+
//! ```
//!
//! `Shutdown` is terminal and only entered explicitly. The stream is owned by
//! the engine loop; connect attempts, connection readers and backoff timers
//! run as separate tasks that post [`StreamEvent`]s back to the loop. Each
//! connection attempt has a generation number and events from older
//! generations are ignored.

use crate::config::BackoffConfig;
use crate::error::SyncError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::Connector;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connection state of the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No connection and none requested yet.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and exchanging messages.
    Active,
    /// Waiting before the next connection attempt.
    Backoff,
    /// Closed for good.
    Shutdown,
}

impl StreamState {
    /// Returns true while a server-confirmed result may still arrive:
    /// the stream is connected, connecting, or has not been started yet.
    pub fn is_reachable(&self) -> bool {
        matches!(
            self,
            StreamState::Disconnected | StreamState::Connecting | StreamState::Active
        )
    }
}

/// Events posted to the engine loop by stream tasks.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Connected {
        generation: u64,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    },
    ConnectFailed {
        generation: u64,
        error: SyncError,
    },
    Message {
        generation: u64,
        message: ServerMessage,
    },
    Closed {
        generation: u64,
    },
    BackoffElapsed {
        generation: u64,
    },
}

impl StreamEvent {
    fn generation(&self) -> u64 {
        match self {
            StreamEvent::Connected { generation, .. }
            | StreamEvent::ConnectFailed { generation, .. }
            | StreamEvent::Message { generation, .. }
            | StreamEvent::Closed { generation }
            | StreamEvent::BackoffElapsed { generation } => *generation,
        }
    }
}

/// What the engine should do after a stream event.
#[derive(Debug)]
pub(crate) enum StreamOutcome {
    /// Nothing to do.
    Ignored,
    /// A connection opened; re-declare targets and re-send writes.
    Opened,
    /// An in-order server message.
    Message(ServerMessage),
    /// The connection (or attempt) failed; views are offline.
    Interrupted,
    /// Sequence numbers skipped or repeated; the stream is already
    /// reconnecting and targets must re-sync without resume tokens.
    Gap {
        expected: u64,
        received: u64,
    },
}

pub(crate) struct WatchStream {
    state: StreamState,
    generation: u64,
    attempt: u32,
    /// Re-syncs forced since the engine last confirmed a good batch.
    gap_streak: u32,
    next_sequence: u64,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    task: Option<JoinHandle<()>>,
    connector: Arc<dyn Connector>,
    backoff: BackoffConfig,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl WatchStream {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        backoff: BackoffConfig,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            state: StreamState::Disconnected,
            generation: 0,
            attempt: 0,
            gap_streak: 0,
            next_sequence: 1,
            outbound: None,
            task: None,
            connector,
            backoff,
            events,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == StreamState::Active
    }

    /// Starts connecting if no connection has been requested yet.
    pub(crate) fn ensure_started(&mut self) {
        if self.state == StreamState::Disconnected {
            self.connect();
        }
    }

    /// Sends a message on the open connection. Returns false when there is
    /// no open connection; the engine re-sends its state on reconnect.
    pub(crate) fn send(&mut self, message: ClientMessage) -> bool {
        if self.state != StreamState::Active {
            return false;
        }
        match &self.outbound {
            Some(outbound) => outbound.send(message).is_ok(),
            None => false,
        }
    }

    pub(crate) fn handle_event(&mut self, event: StreamEvent) -> StreamOutcome {
        if self.state == StreamState::Shutdown || event.generation() != self.generation {
            return StreamOutcome::Ignored;
        }
        match event {
            StreamEvent::Connected { outbound, .. } => {
                tracing::info!(generation = self.generation, "watch stream active");
                self.state = StreamState::Active;
                self.outbound = Some(outbound);
                self.next_sequence = 1;
                StreamOutcome::Opened
            }
            StreamEvent::ConnectFailed { error, .. } => {
                tracing::warn!(error = %error, attempt = self.attempt + 1, "watch stream connect failed");
                self.schedule_backoff();
                StreamOutcome::Interrupted
            }
            StreamEvent::Message { message, .. } => {
                if message.sequence != self.next_sequence {
                    let expected = self.next_sequence;
                    tracing::warn!(
                        expected,
                        received = message.sequence,
                        "sequence gap on watch stream, reconnecting"
                    );
                    self.restart();
                    return StreamOutcome::Gap {
                        expected,
                        received: message.sequence,
                    };
                }
                self.next_sequence += 1;
                self.attempt = 0;
                StreamOutcome::Message(message)
            }
            StreamEvent::Closed { .. } => {
                tracing::warn!(generation = self.generation, "watch stream closed by server");
                self.close_connection();
                self.schedule_backoff();
                StreamOutcome::Interrupted
            }
            StreamEvent::BackoffElapsed { .. } => {
                if self.state == StreamState::Backoff {
                    self.connect();
                }
                StreamOutcome::Ignored
            }
        }
    }

    /// Drops the current connection for a full re-sync. The first re-sync
    /// connects at once; repeated ones before [`WatchStream::confirm_synced`]
    /// back off.
    pub(crate) fn reconnect(&mut self) {
        if self.state == StreamState::Shutdown {
            return;
        }
        tracing::info!(generation = self.generation, "forcing watch stream reconnect");
        self.restart();
    }

    /// The engine applied a change batch; the next re-sync may connect at
    /// once again.
    pub(crate) fn confirm_synced(&mut self) {
        self.gap_streak = 0;
    }

    fn restart(&mut self) {
        self.close_connection();
        self.gap_streak = self.gap_streak.saturating_add(1);
        if self.gap_streak == 1 {
            self.connect();
        } else {
            self.attempt = self.gap_streak - 1;
            self.schedule_backoff();
        }
    }

    /// Closes the stream for good.
    pub(crate) fn shutdown(&mut self) {
        self.close_connection();
        self.generation += 1;
        self.state = StreamState::Shutdown;
        tracing::info!("watch stream shut down");
    }

    fn connect(&mut self) {
        self.generation += 1;
        self.state = StreamState::Connecting;
        tracing::debug!(generation = self.generation, "watch stream connecting");

        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            let connection = match connector.connect().await {
                Ok(connection) => connection,
                Err(error) => {
                    let _ = events.send(StreamEvent::ConnectFailed { generation, error });
                    return;
                }
            };
            let mut inbound = connection.inbound;
            if events
                .send(StreamEvent::Connected {
                    generation,
                    outbound: connection.outbound,
                })
                .is_err()
            {
                return;
            }
            while let Some(message) = inbound.recv().await {
                if events
                    .send(StreamEvent::Message {
                        generation,
                        message,
                    })
                    .is_err()
                {
                    return;
                }
            }
            let _ = events.send(StreamEvent::Closed { generation });
        }));
    }

    fn close_connection(&mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn schedule_backoff(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.backoff.delay_for_attempt(self.attempt);
        self.generation += 1;
        self.state = StreamState::Backoff;
        tracing::debug!(attempt = self.attempt, ?delay, "watch stream backing off");

        let generation = self.generation;
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(StreamEvent::BackoffElapsed { generation });
        }));
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.close_connection();
    }
}
