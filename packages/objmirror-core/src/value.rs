//! In-memory attribute values.
//!
//! Values mirror what the backend can store: JSON scalars and containers plus a handful of
//! typed payloads (dates, geo points, files, relations) and live references to other objects.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::ids::ParentRef;
use crate::object::Object;

/// Attribute map of a single object, ordered by attribute name.
pub type Attributes = BTreeMap<String, Value>;

/// A numeric attribute. Integer arithmetic is kept exact until a float is involved.
#[derive(Clone, Copy, Debug)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Float(f) => *f,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Number::Int(_))
    }

    /// Sum of two numbers; falls back to floating point on overflow or mixed operands.
    pub fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_add(b) {
                Some(sum) => Number::Int(sum),
                None => Number::Float(a as f64 + b as f64),
            },
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn negate(self) -> Number {
        match self {
            Number::Int(i) => match i.checked_neg() {
                Some(n) => Number::Int(n),
                None => Number::Float(-(i as f64)),
            },
            Number::Float(f) => Number::Float(-f),
        }
    }

    pub fn from_json(n: &serde_json::Number) -> Number {
        match n.as_i64() {
            Some(i) => Number::Int(i),
            None => Number::Float(n.as_f64().unwrap_or(f64::NAN)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Number::Int(i) => serde_json::Value::from(*i),
            Number::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::Int(v)
    }
}

impl From<i32> for Number {
    fn from(v: i32) -> Self {
        Number::Int(v as i64)
    }
}

impl From<u32> for Number {
    fn from(v: u32) -> Self {
        Number::Int(v as i64)
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Reference to an uploaded (or not yet uploaded) file. Upload itself happens elsewhere; an
/// unsaved file has no url and cannot be encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRef {
    pub name: String,
    pub url: Option<String>,
}

impl FileRef {
    pub fn new(name: impl Into<String>, url: Option<String>) -> Self {
        Self {
            name: name.into(),
            url,
        }
    }
}

/// Value stored under a relation attribute. Members are never materialized locally.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationValue {
    pub target_class_name: Option<String>,
    pub parent: Option<ParentRef>,
    pub key: Option<String>,
}

impl RelationValue {
    pub fn new(parent: ParentRef, key: impl Into<String>, target_class_name: Option<String>) -> Self {
        Self {
            target_class_name,
            parent: Some(parent),
            key: Some(key.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Date(DateTime<Utc>),
    GeoPoint(GeoPoint),
    File(FileRef),
    Array(Vec<Value>),
    Object(Attributes),
    /// Live reference to another object; equality is by `(class, id)`.
    Pointer(Object),
    Relation(RelationValue),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::GeoPoint(_) => "geopoint",
            Value::File(_) => "file",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Pointer(_) => "pointer",
            Value::Relation(_) => "relation",
        }
    }

    /// Mutable containers whose contents are fingerprinted to detect in-place edits.
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(Number::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Attributes> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&Object> {
        match self {
            Value::Pointer(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_relation(&self) -> Option<&RelationValue> {
        match self {
            Value::Relation(relation) => Some(relation),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(date) => Some(*date),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(Number::Int(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(Number::Int(v as i64))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(Number::Float(v))
    }
}

impl From<Number> for Value {
    fn from(v: Number) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

impl From<GeoPoint> for Value {
    fn from(v: GeoPoint) -> Self {
        Value::GeoPoint(v)
    }
}

impl From<FileRef> for Value {
    fn from(v: FileRef) -> Self {
        Value::File(v)
    }
}

impl From<Object> for Value {
    fn from(v: Object) -> Self {
        Value::Pointer(v)
    }
}

impl From<&Object> for Value {
    fn from(v: &Object) -> Self {
        Value::Pointer(v.clone())
    }
}

impl From<RelationValue> for Value {
    fn from(v: RelationValue) -> Self {
        Value::Relation(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<Attributes> for Value {
    fn from(v: Attributes) -> Self {
        Value::Object(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_addition_stays_exact() {
        assert_eq!(Number::Int(2).add(Number::Int(3)), Number::Int(5));
        assert!(Number::Int(2).add(Number::Int(3)).is_int());
        assert!(!Number::Int(2).add(Number::Float(0.5)).is_int());
    }

    #[test]
    fn integer_overflow_degrades_to_float() {
        let sum = Number::Int(i64::MAX).add(Number::Int(1));
        assert!(!sum.is_int());
        assert!(sum.as_f64() > 9.2e18);
    }

    #[test]
    fn mixed_numbers_compare_by_value() {
        assert_eq!(Number::Int(1), Number::Float(1.0));
        assert_ne!(Number::Int(1), Number::Float(1.5));
    }

    #[test]
    fn only_arrays_and_maps_are_containers() {
        assert!(Value::from(vec![1, 2]).is_container());
        assert!(Value::Object(Attributes::new()).is_container());
        assert!(!Value::from("x").is_container());
        assert!(!Value::Relation(RelationValue::default()).is_container());
    }
}
