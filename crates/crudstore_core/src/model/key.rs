//! Hashable identity keys.

use crate::model::entity::Row;
use crate::model::value::Value;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Identity of one stored row, as reported by its adapter.
///
/// Usually built from the entity's key fields, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(Vec<KeyPart>);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Text(String),
    Uuid(Uuid),
    List(Vec<KeyPart>),
}

impl KeyPart {
    fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(value) => Self::Bool(value),
            Value::Int(value) => Self::Int(value),
            Value::Float(value) => Self::Float(value.to_bits()),
            Value::Text(value) => Self::Text(value),
            Value::Uuid(value) => Self::Uuid(value),
            Value::List(values) => Self::List(values.into_iter().map(Self::from_value).collect()),
        }
    }
}

impl Display for KeyPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Self::Text(value) => write!(f, "{value}"),
            Self::Uuid(value) => write!(f, "{value}"),
            Self::List(parts) => {
                let rendered: Vec<String> = parts.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", rendered.join(","))
            }
        }
    }
}

impl IdentityKey {
    pub fn new(values: impl IntoIterator<Item = Value>) -> Self {
        Self(values.into_iter().map(KeyPart::from_value).collect())
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self::new([value.into()])
    }

    /// Reads `fields` from `row`; missing fields contribute `Null`.
    pub fn from_row(row: &dyn Row, fields: &[&str]) -> Self {
        Self::new(
            fields
                .iter()
                .map(|field| row.value(field).unwrap_or(Value::Null)),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for IdentityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (index, part) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, "/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}
