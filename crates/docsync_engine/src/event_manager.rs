//! Fan-out of view changes to listeners.
//!
//! Each listener keeps the last snapshot it was given; new view results are
//! diffed against it and delivered only when documents changed, or when
//! metadata changed and the listener asked for metadata changes.

use crate::error::SyncError;
use crate::listener::{ListenOptions, ListenerSlot};
use crate::snapshot::ViewSnapshot;
use crate::sync_engine::QueryId;
use crate::view::QueryResult;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct ListenerEntry {
    query_id: QueryId,
    slot: Arc<ListenerSlot>,
    options: ListenOptions,
    last: ViewSnapshot,
}

/// Registered listeners, grouped by query.
#[derive(Debug, Default)]
pub(crate) struct EventManager {
    listeners: HashMap<u64, ListenerEntry>,
    by_query: HashMap<QueryId, Vec<u64>>,
}

impl EventManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a listener and delivers its initial snapshot right away,
    /// even when the result is empty or served from cache.
    pub(crate) fn add(
        &mut self,
        listener_id: u64,
        query_id: QueryId,
        slot: Arc<ListenerSlot>,
        options: ListenOptions,
        initial: QueryResult,
    ) {
        let snapshot = ViewSnapshot::initial(initial);
        slot.deliver(Ok(snapshot.clone()));
        self.by_query
            .entry(query_id.clone())
            .or_default()
            .push(listener_id);
        self.listeners.insert(
            listener_id,
            ListenerEntry {
                query_id,
                slot,
                options,
                last: snapshot,
            },
        );
    }

    /// Delivers a new view result to every listener of the query.
    pub(crate) fn on_view(&mut self, query_id: &str, result: QueryResult) {
        let Some(ids) = self.by_query.get(query_id) else {
            return;
        };
        for id in ids {
            let Some(entry) = self.listeners.get_mut(id) else {
                continue;
            };
            let snapshot = ViewSnapshot::diff(&entry.last, result.clone());
            let raise = !snapshot.changes().is_empty()
                || (entry.options.include_metadata_changes && snapshot.metadata_changed());
            if raise {
                entry.slot.deliver(Ok(snapshot.clone()));
                entry.last = snapshot;
            }
        }
    }

    /// Delivers a listen error once to every listener of the query and
    /// removes them.
    pub(crate) fn on_listen_error(&mut self, query_id: &str, error: &SyncError) {
        let Some(ids) = self.by_query.remove(query_id) else {
            return;
        };
        for id in ids {
            if let Some(entry) = self.listeners.remove(&id) {
                entry.slot.deliver(Err(error.clone()));
                entry.slot.deactivate();
            }
        }
    }

    /// Removes a listener. Returns its query if it was still registered.
    pub(crate) fn remove(&mut self, listener_id: u64) -> Option<QueryId> {
        let entry = self.listeners.remove(&listener_id)?;
        entry.slot.deactivate();
        if let Some(ids) = self.by_query.get_mut(&entry.query_id) {
            ids.retain(|id| *id != listener_id);
            if ids.is_empty() {
                self.by_query.remove(&entry.query_id);
            }
        }
        Some(entry.query_id)
    }

    /// Ends every listener with `error`.
    pub(crate) fn close_all(&mut self, error: &SyncError) {
        for (_, entry) in self.listeners.drain() {
            entry.slot.deliver(Err(error.clone()));
            entry.slot.deactivate();
        }
        self.by_query.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}
