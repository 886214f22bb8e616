//! Resource paths, document keys and field paths.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A slash-separated path of non-empty segments.
///
/// Collection paths have an odd number of segments, document paths an even
/// number. Paths order segment by segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// Parses a slash-separated path. Leading and trailing slashes are ignored.
    pub fn parse(path: &str) -> ModelResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(ModelError::invalid_path(path, "empty segment"));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Builds a path from already-validated segments.
    pub fn from_segments<I, S>(segments: I) -> ModelResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if let Some(bad) = segments.iter().find(|s| s.is_empty() || s.contains('/')) {
            return Err(ModelError::invalid_path(
                segments.join("/"),
                format!("invalid segment {bad:?}"),
            ));
        }
        Ok(Self { segments })
    }

    /// Returns the path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true for the root path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns true if the path addresses a document.
    #[must_use]
    pub fn is_document(&self) -> bool {
        !self.segments.is_empty() && self.segments.len() % 2 == 0
    }

    /// Returns true if the path addresses a collection.
    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.segments.len() % 2 == 1
    }

    /// Returns the last segment, if any.
    #[must_use]
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns the parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: &str) -> ModelResult<Self> {
        let extra = Self::parse(segment)?;
        let mut segments = self.segments.clone();
        segments.extend(extra.segments);
        Ok(Self { segments })
    }

    /// Returns true if `self` is the immediate parent of `other`.
    #[must_use]
    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        other.segments.len() == self.segments.len() + 1
            && other.segments.starts_with(&self.segments)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl From<ResourcePath> for String {
    fn from(path: ResourcePath) -> Self {
        path.to_string()
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// The key of a single document: a resource path with an even number of
/// segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DocumentKey(ResourcePath);

impl DocumentKey {
    /// Parses a document key such as `rooms/eros/messages/2`.
    pub fn parse(path: &str) -> ModelResult<Self> {
        Self::from_path(ResourcePath::parse(path)?)
    }

    /// Wraps a resource path, checking that it addresses a document.
    pub fn from_path(path: ResourcePath) -> ModelResult<Self> {
        if !path.is_document() {
            return Err(ModelError::invalid_path(
                path.to_string(),
                "document keys need an even, non-zero number of segments",
            ));
        }
        Ok(Self(path))
    }

    /// Builds the key of document `id` inside `collection`.
    pub fn new_in(collection: &ResourcePath, id: &str) -> ModelResult<Self> {
        if !collection.is_collection() {
            return Err(ModelError::invalid_path(
                collection.to_string(),
                "not a collection path",
            ));
        }
        Self::from_path(collection.child(id)?)
    }

    /// Returns the underlying path.
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        &self.0
    }

    /// Returns the document id (last segment).
    #[must_use]
    pub fn id(&self) -> &str {
        self.0.last_segment().unwrap_or_default()
    }

    /// Returns the collection that directly contains the document.
    #[must_use]
    pub fn collection(&self) -> ResourcePath {
        self.0.parent().unwrap_or_default()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<DocumentKey> for String {
    fn from(key: DocumentKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for DocumentKey {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// A dotted path into nested map fields, e.g. `address.city`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parses a dotted field path, rejecting empty segments.
    pub fn parse(path: &str) -> ModelResult<Self> {
        let candidate = Self::from(path);
        if !candidate.is_valid() {
            return Err(ModelError::InvalidFieldPath {
                path: path.to_string(),
            });
        }
        Ok(candidate)
    }

    /// Returns the segments of the path.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns true if the path is non-empty and has no empty segment.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| !s.is_empty())
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

impl TryFrom<String> for FieldPath {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}
