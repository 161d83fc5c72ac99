//! Dynamic field value.
//!
//! # Responsibility
//! - Carry scalar field content between typed entities and untyped layers.
//! - Define comparison rules used by in-memory predicate evaluation.
//!
//! # Invariants
//! - `Int` and `Float` compare numerically against each other.
//! - Values of unrelated kinds are never ordered.
//! - `same_as` is reflexive, including for `NaN`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Scalar content of one entity field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    /// Only used as the right-hand side of `In` comparisons.
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Partial ordering across compatible kinds.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Uuid(a), Self::Uuid(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Exact equality for change detection; unlike `==`, `NaN` equals `NaN`.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(left, right)| left.same_as(right))
            }
            _ => self == other,
        }
    }

    /// Equality that tolerates numeric kind differences.
    pub fn loosely_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(_), Self::Float(_)) | (Self::Float(_), Self::Int(_)) => {
                self.compare(other) == Some(Ordering::Equal)
            }
            (Self::Uuid(a), Self::Text(b)) | (Self::Text(b), Self::Uuid(a)) => {
                Uuid::parse_str(b).map(|parsed| parsed == *a).unwrap_or(false)
            }
            _ => self == other,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value:?}"),
            Self::Uuid(value) => write!(f, "{value}"),
            Self::List(values) => {
                write!(f, "[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Self::List(values)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Conversion back from a dynamic value into a typed field.
///
/// Returns `None` when the value kind cannot represent `Self`.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Option<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Option<Self> {
        Some(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bool(value) => Some(value),
            Value::Int(0) => Some(false),
            Value::Int(1) => Some(true),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Option<Self> {
        value.as_int()
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Option<Self> {
        value.as_int().and_then(|value| i32::try_from(value).ok())
    }
}

impl FromValue for u32 {
    fn from_value(value: Value) -> Option<Self> {
        value.as_int().and_then(|value| u32::try_from(value).ok())
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Float(value) => Some(value),
            Value::Int(value) => Some(value as f64),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Uuid(value) => Some(value),
            Value::Text(value) => Uuid::parse_str(&value).ok(),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FromValue, Value};
    use std::cmp::Ordering;
    use uuid::Uuid;

    #[test]
    fn numeric_kinds_compare_across_int_and_float() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
        assert!(Value::Float(3.0).loosely_equals(&Value::Int(3)));
        assert_eq!(Value::Text("a".into()).compare(&Value::Int(1)), None);
    }

    #[test]
    fn same_as_is_reflexive_for_nan() {
        let nan = Value::Float(f64::NAN);
        assert!(nan.same_as(&Value::Float(f64::NAN)));
        assert!(Value::List(vec![nan.clone(), Value::Int(1)])
            .same_as(&Value::List(vec![Value::Float(f64::NAN), Value::Int(1)])));
        assert!(!nan.same_as(&Value::Float(0.0)));
        assert!(!Value::Float(1.0).same_as(&Value::Int(1)));
    }

    #[test]
    fn uuid_matches_its_text_form() {
        let id = Uuid::new_v4();
        assert!(Value::Uuid(id).loosely_equals(&Value::Text(id.to_string())));
        assert_eq!(Uuid::from_value(Value::Text(id.to_string())), Some(id));
    }

    #[test]
    fn optional_fields_round_null() {
        let absent: Option<Option<i64>> = Option::from_value(Value::Null);
        assert_eq!(absent, Some(None));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Option::<i64>::from_value(Value::Text("x".into())), None);
    }

    #[test]
    fn sqlite_style_booleans_are_accepted() {
        assert_eq!(bool::from_value(Value::Int(1)), Some(true));
        assert_eq!(bool::from_value(Value::Int(7)), None);
    }

    #[test]
    fn value_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Value::Int(4)).expect("serialize value");
        assert_eq!(json, r#"{"type":"int","value":4}"#);
        let null: Value = serde_json::from_str(r#"{"type":"null"}"#).expect("parse null");
        assert!(null.is_null());
    }
}
