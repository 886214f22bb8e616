//! Mutations, preconditions and mutation batches.

use crate::document::{Document, Existence};
use crate::error::{ModelError, ModelResult};
use crate::path::{DocumentKey, FieldPath};
use crate::types::{BatchId, SnapshotVersion, Timestamp};
use crate::value::{remove_field, set_field, Fields, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field-level changes of a patch. `None` deletes the field.
pub type Patch = BTreeMap<FieldPath, Option<Value>>;

/// Condition a mutation requires of the current document state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    /// No requirement.
    #[default]
    None,
    /// The document must (or must not) exist.
    Exists(bool),
    /// The document must exist at exactly this version.
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    /// Checks the precondition against a document state.
    ///
    /// A missing or `Unknown` state always passes; only the server can
    /// decide those.
    #[must_use]
    pub fn is_valid_for(&self, doc: Option<&Document>) -> bool {
        let Some(doc) = doc else {
            return true;
        };
        if doc.existence == Existence::Unknown {
            return true;
        }
        match self {
            Precondition::None => true,
            Precondition::Exists(expected) => doc.exists() == *expected,
            Precondition::UpdateTime(version) => doc.exists() && doc.version == *version,
        }
    }

    /// Checks the precondition against authoritative state, where a missing
    /// document simply does not exist.
    #[must_use]
    pub fn is_valid_for_authoritative(&self, doc: Option<&Document>) -> bool {
        let exists = doc.is_some_and(Document::exists);
        match self {
            Precondition::None => true,
            Precondition::Exists(expected) => exists == *expected,
            Precondition::UpdateTime(version) => {
                exists && doc.is_some_and(|d| d.version == *version)
            }
        }
    }
}

/// The kind of change a mutation makes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replace all fields.
    Set(Fields),
    /// Write or delete individual fields.
    Patch(Patch),
    /// Delete the document.
    Delete,
}

/// A single change to one document. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Target document.
    pub key: DocumentKey,
    /// The change.
    pub kind: MutationKind,
    /// Required document state.
    pub precondition: Precondition,
}

impl Mutation {
    /// Creates a set mutation with no precondition.
    pub fn set(key: DocumentKey, fields: Fields) -> Self {
        Self {
            key,
            kind: MutationKind::Set(fields),
            precondition: Precondition::None,
        }
    }

    /// Creates a patch mutation. Patches require the document to exist.
    pub fn patch(key: DocumentKey, patch: Patch) -> Self {
        Self {
            key,
            kind: MutationKind::Patch(patch),
            precondition: Precondition::Exists(true),
        }
    }

    /// Creates a delete mutation with no precondition.
    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
        }
    }

    /// Replaces the precondition.
    #[must_use]
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    /// Applies the mutation to the local view of its document.
    ///
    /// Returns the base unchanged when the precondition does not hold. The
    /// result keeps the base's version and is flagged as locally mutated.
    #[must_use]
    pub fn apply_to_local(&self, base: Option<Document>) -> Option<Document> {
        if !self.precondition.is_valid_for(base.as_ref()) {
            return base;
        }
        let version = base.as_ref().map_or(SnapshotVersion::NONE, |d| d.version);
        let doc = match &self.kind {
            MutationKind::Set(fields) => Document::found(self.key.clone(), version, fields.clone()),
            MutationKind::Patch(_) => self.patched(base, version),
            MutationKind::Delete => Document::deleted(self.key.clone(), version),
        };
        Some(doc.with_local_mutations(true))
    }

    /// Applies the mutation as committed by the server at `commit_version`.
    #[must_use]
    pub fn apply_to_remote(&self, base: Option<Document>, commit_version: SnapshotVersion) -> Document {
        match &self.kind {
            MutationKind::Set(fields) => {
                Document::found(self.key.clone(), commit_version, fields.clone())
            }
            MutationKind::Patch(_) => self.patched(base, commit_version),
            MutationKind::Delete => Document::deleted(self.key.clone(), commit_version),
        }
    }

    fn patched(&self, base: Option<Document>, version: SnapshotVersion) -> Document {
        let MutationKind::Patch(patch) = &self.kind else {
            return Document::unknown(self.key.clone(), version, Fields::new());
        };
        // A known tombstone means the full field set is known after the patch.
        let (mut fields, existence) = match base {
            Some(doc) if doc.existence == Existence::Deleted => (Fields::new(), Existence::Exists),
            Some(doc) => (doc.fields, doc.existence),
            None => (Fields::new(), Existence::Unknown),
        };
        for (path, change) in patch {
            match change {
                Some(value) => set_field(&mut fields, path, value.clone()),
                None => remove_field(&mut fields, path),
            }
        }
        match existence {
            Existence::Exists => Document::found(self.key.clone(), version, fields),
            _ => Document::unknown(self.key.clone(), version, fields),
        }
    }
}

/// Lifecycle state of a mutation batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    /// Awaiting a server response.
    #[default]
    Pending,
    /// Committed by the server.
    Acknowledged,
    /// Refused by the server.
    Rejected,
}

/// An ordered, non-empty group of mutations committed atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// Position in the global application order.
    pub batch_id: BatchId,
    /// Local wall-clock time of the write.
    pub local_write_time: Timestamp,
    /// The mutations, applied in order.
    pub mutations: Vec<Mutation>,
    /// Lifecycle state.
    pub state: BatchState,
}

impl MutationBatch {
    /// Creates a pending batch.
    pub fn new(batch_id: BatchId, mutations: Vec<Mutation>) -> ModelResult<Self> {
        if mutations.is_empty() {
            return Err(ModelError::EmptyBatch);
        }
        Ok(Self {
            batch_id,
            local_write_time: Timestamp::now(),
            mutations,
            state: BatchState::Pending,
        })
    }

    /// Returns every key the batch touches, in mutation order.
    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.mutations.iter().map(|m| &m.key)
    }

    /// Returns true if any mutation targets `key`.
    #[must_use]
    pub fn affects(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|m| &m.key == key)
    }

    /// Applies every mutation of this batch that targets `key`.
    #[must_use]
    pub fn apply_to_local(&self, key: &DocumentKey, base: Option<Document>) -> Option<Document> {
        self.mutations
            .iter()
            .filter(|m| &m.key == key)
            .fold(base, |doc, m| m.apply_to_local(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::parse("users/alice").unwrap()
    }

    fn fields(n: i64) -> Fields {
        let mut f = Fields::new();
        f.insert("n".into(), Value::Integer(n));
        f
    }

    #[test]
    fn set_overwrites_and_flags_local() {
        let base = Document::found(key(), SnapshotVersion::new(4), fields(1));
        let doc = Mutation::set(key(), fields(2))
            .apply_to_local(Some(base))
            .unwrap();
        assert_eq!(doc.fields, fields(2));
        assert_eq!(doc.version, SnapshotVersion::new(4));
        assert!(doc.has_local_mutations);
    }

    #[test]
    fn patch_without_base_is_unknown() {
        let mut patch = Patch::new();
        patch.insert(FieldPath::from("n"), Some(Value::Integer(7)));
        let doc = Mutation::patch(key(), patch).apply_to_local(None).unwrap();
        assert_eq!(doc.existence, Existence::Unknown);
        assert_eq!(doc.fields, fields(7));
    }

    #[test]
    fn patch_on_deleted_is_noop_locally() {
        let base = Document::deleted(key(), SnapshotVersion::new(2));
        let mut patch = Patch::new();
        patch.insert(FieldPath::from("n"), Some(Value::Integer(7)));
        let doc = Mutation::patch(key(), patch)
            .apply_to_local(Some(base.clone()))
            .unwrap();
        assert_eq!(doc, base);
    }

    #[test]
    fn patch_deletes_fields() {
        let base = Document::found(key(), SnapshotVersion::new(1), fields(1));
        let mut patch = Patch::new();
        patch.insert(FieldPath::from("n"), None);
        let doc = Mutation::patch(key(), patch).apply_to_local(Some(base)).unwrap();
        assert!(doc.exists());
        assert!(doc.fields.is_empty());
    }

    #[test]
    fn preconditions() {
        let existing = Document::found(key(), SnapshotVersion::new(3), fields(1));
        let deleted = Document::deleted(key(), SnapshotVersion::new(3));
        let unknown = Document::unknown(key(), SnapshotVersion::new(3), fields(1));

        assert!(Precondition::Exists(true).is_valid_for(Some(&existing)));
        assert!(!Precondition::Exists(true).is_valid_for(Some(&deleted)));
        assert!(Precondition::Exists(false).is_valid_for(Some(&deleted)));
        assert!(Precondition::Exists(true).is_valid_for(Some(&unknown)));
        assert!(Precondition::Exists(true).is_valid_for(None));
        assert!(Precondition::UpdateTime(SnapshotVersion::new(3)).is_valid_for(Some(&existing)));
        assert!(!Precondition::UpdateTime(SnapshotVersion::new(2)).is_valid_for(Some(&existing)));

        assert!(!Precondition::Exists(true).is_valid_for_authoritative(None));
        assert!(Precondition::Exists(false).is_valid_for_authoritative(None));
    }

    #[test]
    fn remote_apply_uses_commit_version() {
        let doc = Mutation::delete(key()).apply_to_remote(None, SnapshotVersion::new(9));
        assert!(doc.is_deleted());
        assert_eq!(doc.version, SnapshotVersion::new(9));
        assert!(!doc.has_local_mutations);
    }

    #[test]
    fn empty_batch_rejected() {
        assert_eq!(
            MutationBatch::new(BatchId::new(1), vec![]).unwrap_err(),
            ModelError::EmptyBatch
        );
    }

    #[test]
    fn batch_applies_only_matching_mutations() {
        let other = DocumentKey::parse("users/bob").unwrap();
        let batch = MutationBatch::new(
            BatchId::new(1),
            vec![
                Mutation::set(key(), fields(1)),
                Mutation::set(other.clone(), fields(2)),
                Mutation::delete(key()),
            ],
        )
        .unwrap();
        assert!(batch.affects(&other));
        let doc = batch.apply_to_local(&key(), None).unwrap();
        assert!(doc.is_deleted());
        let doc = batch.apply_to_local(&other, None).unwrap();
        assert_eq!(doc.fields, fields(2));
    }
}
