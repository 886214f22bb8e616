//! Per-target bookkeeping and query view computation.

use crate::query_engine;
use docsync_model::{Document, DocumentKey, Query, ResumeToken, TargetId};
use std::collections::BTreeSet;

/// Why a target exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetPurpose {
    /// Backs one or more listened queries.
    Listen,
    /// Resolves a single document in limbo.
    Limbo,
}

/// Server-side state of one watch target as seen by the client.
#[derive(Debug, Clone)]
pub(crate) struct TargetState {
    pub(crate) query: Query,
    pub(crate) purpose: TargetPurpose,
    /// Keys the server says are in this target's result set.
    pub(crate) remote_keys: BTreeSet<DocumentKey>,
    /// True once the server has sent the complete result set.
    pub(crate) current: bool,
    /// Resume point, set once the target has been current.
    pub(crate) resume_token: Option<ResumeToken>,
}

impl TargetState {
    pub(crate) fn new(query: Query, purpose: TargetPurpose) -> Self {
        Self {
            query,
            purpose,
            remote_keys: BTreeSet::new(),
            current: false,
            resume_token: None,
        }
    }

    /// Forgets membership so the next sync starts from scratch.
    pub(crate) fn reset(&mut self) {
        self.remote_keys.clear();
        self.current = false;
    }
}

/// The computed result of a query at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// The query.
    pub query: Query,
    /// Matching documents in query order.
    pub documents: Vec<Document>,
    /// True unless the result is fully confirmed by an active server stream.
    pub from_cache: bool,
    /// True if any returned document has pending local writes.
    pub has_pending_writes: bool,
}

/// Local view of one listened query.
#[derive(Debug)]
pub(crate) struct QueryView {
    pub(crate) target_id: TargetId,
    pub(crate) query: Query,
    /// Documents in the result the server has not confirmed.
    pub(crate) limbo_keys: BTreeSet<DocumentKey>,
    /// Last computed result, used to suppress unchanged emissions.
    pub(crate) last: Option<QueryResult>,
}

impl QueryView {
    pub(crate) fn new(target_id: TargetId, query: Query) -> Self {
        Self {
            target_id,
            query,
            limbo_keys: BTreeSet::new(),
            last: None,
        }
    }

    /// Recomputes the view from local candidates and target state.
    ///
    /// Returns the new result if it differs from the last one.
    pub(crate) fn refresh(
        &mut self,
        candidates: Vec<Document>,
        target: Option<&TargetState>,
        online: bool,
    ) -> Option<QueryResult> {
        let result = self.compute(candidates, target, online);
        if self.last.as_ref() == Some(&result) {
            return None;
        }
        self.last = Some(result.clone());
        Some(result)
    }

    /// Computes the result without recording it.
    pub(crate) fn compute(
        &mut self,
        candidates: Vec<Document>,
        target: Option<&TargetState>,
        online: bool,
    ) -> QueryResult {
        let documents = query_engine::evaluate(&self.query, candidates);
        let current = target.is_some_and(|t| t.current);

        self.limbo_keys = match target {
            Some(target) if target.current => documents
                .iter()
                .filter(|doc| !doc.has_local_mutations && !target.remote_keys.contains(&doc.key))
                .map(|doc| doc.key.clone())
                .collect(),
            _ => BTreeSet::new(),
        };

        let has_pending_writes = documents.iter().any(|doc| doc.has_local_mutations);
        QueryResult {
            query: self.query.clone(),
            from_cache: !(online && current && self.limbo_keys.is_empty()),
            has_pending_writes,
            documents,
        }
    }
}
