//! Declarative query targets.
//!
//! A [`Query`] names a collection (or a single document) plus filters,
//! ordering clauses and an optional limit. The same query value is used to
//! key watch targets, so [`Query::canonical_id`] must be stable.

use crate::document::Document;
use crate::error::{ModelError, ModelResult};
use crate::path::{DocumentKey, FieldPath, ResourcePath};
use crate::value::{lookup_field, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Write as _;

/// Comparison operator of a field filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// Array field contains the value.
    ArrayContains,
    /// Field equals one of the values of an array operand.
    In,
}

impl FilterOp {
    /// Returns true for range and `!=` operators.
    #[must_use]
    pub fn is_inequality(self) -> bool {
        matches!(
            self,
            FilterOp::NotEqual
                | FilterOp::LessThan
                | FilterOp::LessThanOrEqual
                | FilterOp::GreaterThan
                | FilterOp::GreaterThanOrEqual
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            FilterOp::Equal => "==",
            FilterOp::NotEqual => "!=",
            FilterOp::LessThan => "<",
            FilterOp::LessThanOrEqual => "<=",
            FilterOp::GreaterThan => ">",
            FilterOp::GreaterThanOrEqual => ">=",
            FilterOp::ArrayContains => "array-contains",
            FilterOp::In => "in",
        }
    }
}

/// A single `field op value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Field being tested.
    pub field: FieldPath,
    /// Operator.
    pub op: FilterOp,
    /// Operand.
    pub value: Value,
}

impl FieldFilter {
    /// Evaluates the filter against a document. Missing fields never match.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = lookup_field(&doc.fields, &self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Equal => actual.equals_total(&self.value),
            FilterOp::NotEqual => !actual.equals_total(&self.value),
            FilterOp::ArrayContains => actual
                .as_array()
                .is_some_and(|items| items.iter().any(|v| v.equals_total(&self.value))),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|items| items.iter().any(|v| v.equals_total(actual))),
            op => {
                // Range comparisons only match values of the same type class.
                if !same_type_class(actual, &self.value) {
                    return false;
                }
                let ord = actual.cmp_total(&self.value);
                match op {
                    FilterOp::LessThan => ord == Ordering::Less,
                    FilterOp::LessThanOrEqual => ord != Ordering::Greater,
                    FilterOp::GreaterThan => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                }
            }
        }
    }
}

fn same_type_class(a: &Value, b: &Value) -> bool {
    (a.is_number() && b.is_number()) || std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// An ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field to sort by.
    pub field: FieldPath,
    /// Direction.
    pub direction: Direction,
}

/// A declarative query over one collection or a single document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Collection path, or a document path for single-document targets.
    pub path: ResourcePath,
    /// Conjunction of filters.
    pub filters: Vec<FieldFilter>,
    /// Ordering clauses, applied before the implicit key ordering.
    pub order_by: Vec<OrderBy>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl Query {
    /// Creates a query over every document directly in `path`.
    pub fn collection(path: &str) -> ModelResult<Self> {
        let path = ResourcePath::parse(path)?;
        if !path.is_collection() {
            return Err(ModelError::invalid_path(
                path.to_string(),
                "not a collection path",
            ));
        }
        Ok(Self::at_collection(path))
    }

    /// Creates a query over an already parsed collection path.
    #[must_use]
    pub fn at_collection(path: ResourcePath) -> Self {
        Self {
            path,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Creates a single-document query.
    #[must_use]
    pub fn document(key: &DocumentKey) -> Self {
        Self::at_collection(key.path().clone())
    }

    /// Adds a filter.
    #[must_use]
    pub fn filter(mut self, field: impl Into<FieldPath>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Adds an ordering clause.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<FieldPath>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Limits the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the query targets exactly one document.
    #[must_use]
    pub fn is_document_query(&self) -> bool {
        self.path.is_document()
    }

    /// Returns the key of a single-document query.
    #[must_use]
    pub fn document_key(&self) -> Option<DocumentKey> {
        DocumentKey::from_path(self.path.clone()).ok()
    }

    /// Stable textual identity; equal queries produce equal ids.
    #[must_use]
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.to_string();
        for f in &self.filters {
            let _ = write!(id, "|f:{}{}{:?}", f.field, f.op.symbol(), canonical_operand(&f.value));
        }
        for o in &self.order_by {
            let dir = match o.direction {
                Direction::Ascending => "asc",
                Direction::Descending => "desc",
            };
            let _ = write!(id, "|ob:{}:{dir}", o.field);
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        id
    }

    /// Fails fast on structurally invalid queries.
    ///
    /// Arbitrary filter/order combinations are allowed, except range
    /// filters on more than one field and a first ordering that differs from
    /// the range field.
    pub fn validate(&self) -> ModelResult<()> {
        if self.is_document_query() && (!self.filters.is_empty() || !self.order_by.is_empty()) {
            return Err(ModelError::invalid_query(
                "single-document queries cannot filter or order",
            ));
        }
        if !self.is_document_query() && !self.path.is_collection() {
            return Err(ModelError::invalid_query("query path must be a collection"));
        }
        for f in &self.filters {
            if !f.field.is_valid() {
                return Err(ModelError::InvalidFieldPath {
                    path: f.field.to_string(),
                });
            }
            if f.op == FilterOp::In && f.value.as_array().is_none() {
                return Err(ModelError::invalid_query(format!(
                    "'in' filter on {} needs an array operand",
                    f.field
                )));
            }
        }
        for o in &self.order_by {
            if !o.field.is_valid() {
                return Err(ModelError::InvalidFieldPath {
                    path: o.field.to_string(),
                });
            }
        }
        let mut inequality: Option<&FieldPath> = None;
        for f in self.filters.iter().filter(|f| f.op.is_inequality()) {
            match inequality {
                Some(existing) if existing != &f.field => {
                    return Err(ModelError::invalid_query(format!(
                        "inequality filters on both {existing} and {}",
                        f.field
                    )));
                }
                _ => inequality = Some(&f.field),
            }
        }
        if let (Some(field), Some(first)) = (inequality, self.order_by.first()) {
            if &first.field != field {
                return Err(ModelError::invalid_query(format!(
                    "first order-by must be on inequality field {field}, not {}",
                    first.field
                )));
            }
        }
        Ok(())
    }

    /// Returns true if the document belongs in this query's result set,
    /// ignoring the limit.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        if !doc.exists() {
            return false;
        }
        let in_path = if self.is_document_query() {
            doc.key.path() == &self.path
        } else {
            self.path.is_immediate_parent_of(doc.key.path())
        };
        in_path
            && self.filters.iter().all(|f| f.matches(doc))
            && self.order_by.iter().all(|o| doc.get(&o.field).is_some())
    }

    /// Orders two matching documents: ordering clauses, then key ascending.
    #[must_use]
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for clause in &self.order_by {
            let ord = match (a.get(&clause.field), b.get(&clause.field)) {
                (Some(x), Some(y)) => x.cmp_total(y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ord = match clause.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.key.cmp(&b.key)
    }
}

/// Rewrites integral doubles as integers so numerically equal operands share an id.
fn canonical_operand(value: &Value) -> Value {
    // 2^63, the first double above i64::MAX.
    const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;
    match value {
        Value::Double(d) if d.fract() == 0.0 && *d >= -I64_LIMIT && *d < I64_LIMIT => {
            Value::Integer(*d as i64)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_operand).collect()),
        Value::Map(fields) => Value::Map(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), canonical_operand(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
