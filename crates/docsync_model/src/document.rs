//! Documents and their existence state.

use crate::path::{DocumentKey, FieldPath};
use crate::types::SnapshotVersion;
use crate::value::{lookup_field, Fields, Value};
use serde::{Deserialize, Serialize};

/// What is known about a document's existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Existence {
    /// The document exists with the stored fields.
    Exists,
    /// The document is known not to exist.
    Deleted,
    /// Only part of the document is known (patched without a base).
    Unknown,
}

/// A document at a specific version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// The document key.
    pub key: DocumentKey,
    /// Server version this state reflects. Local-only states keep the
    /// version of their remote base.
    pub version: SnapshotVersion,
    /// Existence state.
    pub existence: Existence,
    /// Field data. Empty unless the document exists or is unknown.
    pub fields: Fields,
    /// True when pending local mutations contributed to this state.
    #[serde(skip)]
    pub has_local_mutations: bool,
}

impl Document {
    /// Creates an existing document.
    pub fn found(key: DocumentKey, version: SnapshotVersion, fields: Fields) -> Self {
        Self {
            key,
            version,
            existence: Existence::Exists,
            fields,
            has_local_mutations: false,
        }
    }

    /// Creates a deleted (tombstone) document.
    pub fn deleted(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            version,
            existence: Existence::Deleted,
            fields: Fields::new(),
            has_local_mutations: false,
        }
    }

    /// Creates a document whose existence is not known.
    pub fn unknown(key: DocumentKey, version: SnapshotVersion, fields: Fields) -> Self {
        Self {
            key,
            version,
            existence: Existence::Unknown,
            fields,
            has_local_mutations: false,
        }
    }

    /// Returns true if the document exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.existence == Existence::Exists
    }

    /// Returns true if the document is known to be deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.existence == Existence::Deleted
    }

    /// Reads a possibly nested field.
    #[must_use]
    pub fn get(&self, field: &FieldPath) -> Option<&Value> {
        lookup_field(&self.fields, field)
    }

    /// Returns a copy marked with the given local-mutation flag.
    #[must_use]
    pub fn with_local_mutations(mut self, pending: bool) -> Self {
        self.has_local_mutations = pending;
        self
    }
}
