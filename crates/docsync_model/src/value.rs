//! Dynamic document values.

use crate::path::{DocumentKey, FieldPath};
use crate::types::Timestamp;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// The top-level field map of a document.
pub type Fields = BTreeMap<String, Value>;

/// A dynamically typed document value.
///
/// Values have a total order, first by type class
/// (null < bool < number < timestamp < text < bytes < reference < array < map),
/// then within the class. Integers and doubles share the number class and
/// compare numerically; NaN sorts before every other number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Double(f64),
    /// Point in time.
    Timestamp(Timestamp),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Bytes),
    /// A typed reference to another document.
    Reference(DocumentKey),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested map.
    Map(Fields),
}

impl Value {
    fn type_order(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) | Value::Double(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Text(_) => 4,
            Value::Bytes(_) => 5,
            Value::Reference(_) => 6,
            Value::Array(_) => 7,
            Value::Map(_) => 8,
        }
    }

    /// Total order used by queries and sorting.
    #[must_use]
    pub fn cmp_total(&self, other: &Self) -> Ordering {
        let by_type = self.type_order().cmp(&other.type_order());
        if by_type != Ordering::Equal {
            return by_type;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(a), Value::Double(b)) => compare_integer_double(*a, *b),
            (Value::Double(a), Value::Integer(b)) => compare_integer_double(*b, *a).reverse(),
            (Value::Double(a), Value::Double(b)) => compare_doubles(*a, *b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Reference(a), Value::Reference(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.cmp_total(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.cmp_total(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }

    /// Equality under the total order, so `1 == 1.0`.
    #[must_use]
    pub fn equals_total(&self, other: &Self) -> bool {
        self.cmp_total(other) == Ordering::Equal
    }

    /// Returns true for integers and doubles.
    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Double(_))
    }

    /// Returns the boolean if this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer if this is an `Integer`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the text if this is `Text`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the referenced key if this is a `Reference`.
    #[must_use]
    pub fn as_reference(&self) -> Option<&DocumentKey> {
        match self {
            Value::Reference(key) => Some(key),
            _ => None,
        }
    }

    /// Returns the elements if this is an `Array`.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the nested map if this is a `Map`.
    #[must_use]
    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        // -0.0 and 0.0 compare equal here, unlike total_cmp.
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Compares an integer with a double without rounding the integer.
fn compare_integer_double(i: i64, d: f64) -> Ordering {
    // 2^63, the first double above i64::MAX.
    const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if d.is_nan() {
        return Ordering::Greater;
    }
    if d >= I64_LIMIT {
        return Ordering::Less;
    }
    if d < -I64_LIMIT {
        return Ordering::Greater;
    }
    let whole = d.trunc();
    // In range, so the cast is exact.
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => compare_doubles(0.0, d - whole),
        ord => ord,
    }
}

/// Looks up a possibly nested field.
#[must_use]
pub fn lookup_field<'a>(fields: &'a Fields, path: &FieldPath) -> Option<&'a Value> {
    let (first, rest) = path.segments().split_first()?;
    let mut current = fields.get(first)?;
    for segment in rest {
        current = current.as_map()?.get(segment)?;
    }
    Some(current)
}

/// Writes a possibly nested field, creating or replacing intermediate maps.
pub fn set_field(fields: &mut Fields, path: &FieldPath, value: Value) {
    let Some((last, parents)) = path.segments().split_last() else {
        return;
    };
    let mut current = fields;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Map(Fields::new()));
        if !matches!(entry, Value::Map(_)) {
            *entry = Value::Map(Fields::new());
        }
        current = match entry {
            Value::Map(map) => map,
            _ => return,
        };
    }
    current.insert(last.clone(), value);
}

/// Removes a possibly nested field. Missing intermediate maps are ignored.
pub fn remove_field(fields: &mut Fields, path: &FieldPath) {
    let Some((last, parents)) = path.segments().split_last() else {
        return;
    };
    let mut current = fields;
    for segment in parents {
        current = match current.get_mut(segment) {
            Some(Value::Map(map)) => map,
            _ => return,
        };
    }
    current.remove(last);
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DocumentKey> for Value {
    fn from(v: DocumentKey) -> Self {
        Value::Reference(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

impl From<Fields> for Value {
    fn from(v: Fields) -> Self {
        Value::Map(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}
