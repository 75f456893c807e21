//! The dynamic value model: a tagged sum type plus an order-preserving
//! document map. Field order on a [`Document`] is stable as inserted
//! because `$rename` and `$unset` are legal update operators and must not
//! reshuffle unrelated fields.

use crate::object_id::ObjectId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Discriminant for [`Value`], used by `$type` and by the key codec to
/// order values of different kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    /// `null`
    Null,
    /// `bool`
    Bool,
    /// `int64`
    Int64,
    /// `double`
    Double,
    /// `string`
    String,
    /// `bytes`
    Bytes,
    /// `timestamp`
    Timestamp,
    /// `object-id`
    ObjectId,
    /// `array`
    Array,
    /// `document`
    Document,
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeTag::Null => "null",
            TypeTag::Bool => "bool",
            TypeTag::Int64 => "int64",
            TypeTag::Double => "double",
            TypeTag::String => "string",
            TypeTag::Bytes => "bytes",
            TypeTag::Timestamp => "timestamp",
            TypeTag::ObjectId => "object-id",
            TypeTag::Array => "array",
            TypeTag::Document => "document",
        };
        f.write_str(s)
    }
}

/// Unified dynamic value. Ordering between variants of different `TypeTag`
/// follows §3 of the data model: null < bool < int < double < string <
/// bytes < timestamp < object-id < array < document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Absence of a value, distinct from a missing field.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int64(i64),
    /// IEEE-754 double.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// Milliseconds since epoch.
    Timestamp(i64),
    /// 12-byte identifier.
    ObjectId(ObjectId),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Embedded document.
    Document(Document),
}

impl Value {
    /// The [`TypeTag`] discriminant for `$type` queries and key encoding.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int64(_) => TypeTag::Int64,
            Value::Double(_) => TypeTag::Double,
            Value::String(_) => TypeTag::String,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::Timestamp(_) => TypeTag::Timestamp,
            Value::ObjectId(_) => TypeTag::ObjectId,
            Value::Array(_) => TypeTag::Array,
            Value::Document(_) => TypeTag::Document,
        }
    }

    /// True for `Value::Null`. Sparse/missing-field semantics distinguish
    /// this from a field that is simply absent from the document.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric coercion used by arithmetic update operators: integers
    /// widen to double only when necessary.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Borrow the value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Borrow the value as a document, if it is one.
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_value(other) == Some(Ordering::Equal)
    }
}

impl Value {
    /// Cross-type comparison per the natural ordering in §3 of the data
    /// model. Returns `None` only when both operands are `NaN` doubles
    /// and thus genuinely incomparable.
    pub fn cmp_value(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int64(a), Int64(b)) => Some(a.cmp(b)),
            (Double(a), Double(b)) => a.partial_cmp(b),
            (Int64(a), Double(b)) => (*a as f64).partial_cmp(b),
            (Double(a), Int64(b)) => a.partial_cmp(&(*b as f64)),
            (String(a), String(b)) => Some(a.cmp(b)),
            (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (ObjectId(a), ObjectId(b)) => Some(a.cmp(b)),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp_value(y) {
                        Some(Ordering::Equal) => continue,
                        other => return other,
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (Document(a), Document(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    match ka.cmp(kb) {
                        Ordering::Equal => {}
                        other => return Some(other),
                    }
                    match va.cmp_value(vb) {
                        Some(Ordering::Equal) => continue,
                        other => return other,
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            // Cross-type: fall back to type-tag ordering (§3).
            (a, b) if a.type_tag() != b.type_tag() => Some(a.type_tag().cmp(&b.type_tag())),
            _ => None,
        }
    }
}

/// An order-preserving field map: LauraDB documents are not JSON objects
/// internally, they are insertion-ordered `(String, Value)` sequences so
/// that `$rename`/`$unset` never reorder unrelated fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    /// An empty document.
    pub fn new() -> Self {
        Document { fields: Vec::new() }
    }

    /// Number of top-level fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Look up a top-level field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Set a top-level field, preserving its existing position if present,
    /// else appending at the end (insertion order).
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(entry) = self.fields.iter_mut().find(|(k, _)| *k == name) {
            entry.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    /// Remove a field by name, returning its value if present.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(k, _)| k == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Rename a field in place, keeping its position.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if let Some(entry) = self.fields.iter_mut().find(|(k, _)| k == from) {
            entry.0 = to.to_string();
            true
        } else {
            false
        }
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.fields.iter()
    }

    /// Resolve a dotted field path (`a.b.c`), descending through nested
    /// documents and, for numeric segments, array indices.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for seg in segments {
            current = match current {
                Value::Document(d) => d.get(seg)?,
                Value::Array(a) => {
                    let idx: usize = seg.parse().ok()?;
                    a.get(idx)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a value at a dotted field path, creating intermediate documents
    /// as needed. Array segments are not created implicitly.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop().expect("path must have at least one segment");
        let mut doc = self;
        for seg in segments {
            let existing = doc.get(seg);
            if !matches!(existing, Some(Value::Document(_))) {
                doc.set(seg, Value::Document(Document::new()));
            }
            doc = match doc.fields.iter_mut().find(|(k, _)| k == seg) {
                Some((_, Value::Document(d))) => d,
                _ => unreachable!("just inserted a document"),
            };
        }
        doc.set(last, value);
    }

    /// Remove a value at a dotted field path.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop()?;
        let mut doc = self;
        for seg in segments {
            doc = match doc.fields.iter_mut().find(|(k, _)| k == seg) {
                Some((_, Value::Document(d))) => d,
                _ => return None,
            };
        }
        doc.remove(last)
    }

    /// The document's `_id` field, if present.
    pub fn id(&self) -> Option<&Value> {
        self.get("_id")
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Document {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_order_is_stable_across_set_and_rename() {
        let mut doc = Document::new();
        doc.set("a", Value::Int64(1));
        doc.set("b", Value::Int64(2));
        doc.set("c", Value::Int64(3));
        doc.rename("b", "bee");
        let names: Vec<&str> = doc.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["a", "bee", "c"]);
    }

    #[test]
    fn dotted_path_get_and_set() {
        let mut doc = Document::new();
        doc.set_path("address.city", Value::String("NYC".into()));
        assert_eq!(doc.get_path("address.city"), Some(&Value::String("NYC".into())));
        assert!(doc.get_path("address.zip").is_none());
    }

    #[test]
    fn cross_type_ordering_follows_data_model() {
        assert_eq!(Value::Null.cmp_value(&Value::Bool(false)), Some(Ordering::Less));
        assert_eq!(
            Value::Int64(5).cmp_value(&Value::Double(5.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Double(1.0).cmp_value(&Value::String("a".into())),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn remove_path_drops_nested_field() {
        let mut doc = Document::new();
        doc.set_path("a.b", Value::Int64(1));
        assert_eq!(doc.remove_path("a.b"), Some(Value::Int64(1)));
        assert!(doc.get_path("a.b").is_none());
    }
}
