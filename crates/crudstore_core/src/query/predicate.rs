//! Predicate tree used by specifications, relationship joins and adapters.
//!
//! # Invariants
//! - A comparison against a missing field is `false`.
//! - `Related` nodes never match through plain `matches`; they need a
//!   navigation resolver (see `query::navigation`).

use crate::model::{Row, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Right-hand side must be a `Value::List`.
    In,
    Contains,
    StartsWith,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    True,
    False,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare(Comparison),
    IsNull {
        field: String,
    },
    /// Matches when any entity reached through relation `field` satisfies
    /// `predicate`.
    Related {
        field: String,
        predicate: Box<Predicate>,
    },
}

impl Predicate {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare(Comparison {
            field: field.into(),
            op,
            value: value.into(),
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lte, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gte, value)
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::compare(field, CompareOp::In, Value::List(values))
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Contains, value)
    }

    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::StartsWith, Value::Text(prefix.into()))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull {
            field: field.into(),
        }
    }

    pub fn related(field: impl Into<String>, predicate: Predicate) -> Self {
        Self::Related {
            field: field.into(),
            predicate: Box::new(predicate),
        }
    }

    pub fn negate(self) -> Self {
        match self {
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }

    /// Conjunction, flattening nested `And` and dropping `True`.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::True, other) | (other, Self::True) => other,
            (Self::False, _) | (_, Self::False) => Self::False,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (other, Self::And(mut right)) => {
                right.insert(0, other);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }

    /// Disjunction, flattening nested `Or` and dropping `False`.
    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::False, other) | (other, Self::False) => other,
            (Self::True, _) | (_, Self::True) => Self::True,
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (other, Self::Or(mut right)) => {
                right.insert(0, other);
                Self::Or(right)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }

    pub fn all(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        predicates.into_iter().fold(Self::True, Self::and)
    }

    pub fn any(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        predicates.into_iter().fold(Self::False, Self::or)
    }

    /// True when the tree contains at least one `Related` node.
    pub fn has_navigation(&self) -> bool {
        match self {
            Self::Related { .. } => true,
            Self::And(children) | Self::Or(children) => {
                children.iter().any(Predicate::has_navigation)
            }
            Self::Not(inner) => inner.has_navigation(),
            _ => false,
        }
    }

    /// Evaluates against scalar fields only.
    #[must_use]
    pub fn matches(&self, row: &dyn Row) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::And(children) => children.iter().all(|child| child.matches(row)),
            Self::Or(children) => children.iter().any(|child| child.matches(row)),
            Self::Not(inner) => !inner.matches(row),
            Self::Compare(comparison) => comparison.matches(row),
            Self::IsNull { field } => matches!(row.value(field), Some(Value::Null)),
            Self::Related { .. } => false,
        }
    }
}

impl Comparison {
    pub fn matches(&self, row: &dyn Row) -> bool {
        let Some(actual) = row.value(&self.field) else {
            return false;
        };
        compare_values(&actual, self.op, &self.value)
    }
}

pub(crate) fn compare_values(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => actual.loosely_equals(expected),
        CompareOp::Ne => !actual.loosely_equals(expected),
        CompareOp::Lt => actual.compare(expected).is_some_and(Ordering::is_lt),
        CompareOp::Lte => actual.compare(expected).is_some_and(Ordering::is_le),
        CompareOp::Gt => actual.compare(expected).is_some_and(Ordering::is_gt),
        CompareOp::Gte => actual.compare(expected).is_some_and(Ordering::is_ge),
        CompareOp::In => match expected {
            Value::List(items) => items.iter().any(|item| actual.loosely_equals(item)),
            _ => false,
        },
        CompareOp::Contains => match (actual, expected) {
            (Value::Text(text), Value::Text(needle)) => text.contains(needle.as_str()),
            (Value::List(items), needle) => items.iter().any(|item| item.loosely_equals(needle)),
            _ => false,
        },
        CompareOp::StartsWith => match (actual, expected) {
            (Value::Text(text), Value::Text(prefix)) => text.starts_with(prefix.as_str()),
            _ => false,
        },
    }
}
