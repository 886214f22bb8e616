//! Snapshots delivered to listeners and readers.
//!
//! A [`ViewSnapshot`] is an immutable, ordered result set plus the list of
//! document changes relative to the snapshot previously delivered to the
//! same listener.

use crate::view::QueryResult;
use docsync_model::{Document, DocumentKey, FieldPath, Fields, Query, Value};
use std::collections::HashMap;

/// Kind of change a document went through between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// The document entered the result set.
    Added,
    /// The document left the result set.
    Removed,
    /// The document's contents changed.
    Modified,
}

/// One document change between consecutive snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Kind of change.
    pub kind: ChangeType,
    /// Document state after the change (before it, for removals).
    pub document: Document,
    /// Position in the previous snapshot.
    pub old_index: Option<usize>,
    /// Position in the new snapshot.
    pub new_index: Option<usize>,
}

/// Freshness of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    /// True unless every document is confirmed by an active server stream.
    pub from_cache: bool,
    /// True if any document carries unacknowledged local writes.
    pub has_pending_writes: bool,
}

/// An ordered query result with its changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    query: Query,
    documents: Vec<Document>,
    changes: Vec<DocumentChange>,
    metadata: SnapshotMetadata,
    sync_state_changed: bool,
    metadata_changed: bool,
}

impl ViewSnapshot {
    /// First snapshot for a listener: every document is `Added`.
    pub(crate) fn initial(result: QueryResult) -> Self {
        let changes = result
            .documents
            .iter()
            .enumerate()
            .map(|(index, doc)| DocumentChange {
                kind: ChangeType::Added,
                document: doc.clone(),
                old_index: None,
                new_index: Some(index),
            })
            .collect();
        Self {
            query: result.query,
            documents: result.documents,
            changes,
            metadata: SnapshotMetadata {
                from_cache: result.from_cache,
                has_pending_writes: result.has_pending_writes,
            },
            sync_state_changed: true,
            metadata_changed: false,
        }
    }

    /// Snapshot for `result` with changes relative to `previous`.
    pub(crate) fn diff(previous: &ViewSnapshot, result: QueryResult) -> Self {
        let old_positions: HashMap<&DocumentKey, usize> = previous
            .documents
            .iter()
            .enumerate()
            .map(|(index, doc)| (&doc.key, index))
            .collect();
        let new_keys: HashMap<&DocumentKey, usize> = result
            .documents
            .iter()
            .enumerate()
            .map(|(index, doc)| (&doc.key, index))
            .collect();

        let mut changes = Vec::new();
        let mut local_flags_changed = false;
        for (index, old) in previous.documents.iter().enumerate() {
            if !new_keys.contains_key(&old.key) {
                changes.push(DocumentChange {
                    kind: ChangeType::Removed,
                    document: old.clone(),
                    old_index: Some(index),
                    new_index: None,
                });
            }
        }
        for (index, doc) in result.documents.iter().enumerate() {
            match old_positions.get(&doc.key) {
                None => changes.push(DocumentChange {
                    kind: ChangeType::Added,
                    document: doc.clone(),
                    old_index: None,
                    new_index: Some(index),
                }),
                Some(&old_index) => {
                    let old = &previous.documents[old_index];
                    if old.fields != doc.fields || old.existence != doc.existence {
                        changes.push(DocumentChange {
                            kind: ChangeType::Modified,
                            document: doc.clone(),
                            old_index: Some(old_index),
                            new_index: Some(index),
                        });
                    } else if old.has_local_mutations != doc.has_local_mutations {
                        local_flags_changed = true;
                    }
                }
            }
        }

        let metadata = SnapshotMetadata {
            from_cache: result.from_cache,
            has_pending_writes: result.has_pending_writes,
        };
        Self {
            query: result.query,
            documents: result.documents,
            changes,
            sync_state_changed: previous.metadata.from_cache != metadata.from_cache,
            metadata_changed: previous.metadata != metadata || local_flags_changed,
            metadata,
        }
    }

    /// The query this snapshot answers.
    #[must_use]
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Documents in query order.
    #[must_use]
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Iterates over documents in query order.
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.documents.iter()
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the result set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Document changes since the previous snapshot for the same listener.
    #[must_use]
    pub fn changes(&self) -> &[DocumentChange] {
        &self.changes
    }

    /// Snapshot metadata.
    #[must_use]
    pub fn metadata(&self) -> SnapshotMetadata {
        self.metadata
    }

    /// Shortcut for `metadata().from_cache`.
    #[must_use]
    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache
    }

    /// Shortcut for `metadata().has_pending_writes`.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes
    }

    /// True if `from_cache` flipped since the previous snapshot.
    #[must_use]
    pub fn sync_state_changed(&self) -> bool {
        self.sync_state_changed
    }

    /// True if metadata or a document's pending-write flag changed.
    #[must_use]
    pub fn metadata_changed(&self) -> bool {
        self.metadata_changed
    }

    /// The snapshot of a single document in this result.
    #[must_use]
    pub fn document_snapshot(&self, key: &DocumentKey) -> DocumentSnapshot {
        let document = self.documents.iter().find(|doc| &doc.key == key).cloned();
        DocumentSnapshot::new(key.clone(), document, self.metadata)
    }
}

/// A single document as read by the application.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    document: Option<Document>,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub(crate) fn new(
        key: DocumentKey,
        document: Option<Document>,
        metadata: SnapshotMetadata,
    ) -> Self {
        let document = document.filter(Document::exists);
        Self {
            key,
            document,
            metadata,
        }
    }

    /// Returns true if the document exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.document.is_some()
    }

    /// The document's fields, if it exists.
    #[must_use]
    pub fn data(&self) -> Option<&Fields> {
        self.document.as_ref().map(|doc| &doc.fields)
    }

    /// Reads a (possibly nested) field.
    #[must_use]
    pub fn get(&self, field: impl Into<FieldPath>) -> Option<&Value> {
        let field = field.into();
        self.document.as_ref().and_then(|doc| doc.get(&field))
    }

    /// The document, if it exists.
    #[must_use]
    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    /// The document id (last path segment).
    #[must_use]
    pub fn id(&self) -> &str {
        self.key.id()
    }

    /// The document key, usable as a reference value.
    #[must_use]
    pub fn reference(&self) -> &DocumentKey {
        &self.key
    }

    /// Snapshot metadata.
    #[must_use]
    pub fn metadata(&self) -> SnapshotMetadata {
        self.metadata
    }

    /// Shortcut for `metadata().from_cache`.
    #[must_use]
    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache
    }

    /// Shortcut for `metadata().has_pending_writes`.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes
    }
}
