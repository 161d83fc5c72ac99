//! Storage adapter contracts.
//!
//! # Responsibility
//! - Define the CRUD surface the unit of work drives during commit.
//! - Define the read surface used to run specifications and report
//!   row identity.
//! - Define the command surface for statements that change storage without
//!   returning entities.
//!
//! # Invariants
//! - `identity` is stable for a stored row across reads.
//! - `create` may assign generated keys by mutating the entity in place.
//! - Adapters never track state; tracking lives in `crate::tracking`.
//!
//! # See also
//! - crate::tracking::UnitOfWork::commit

use crate::db::DbError;
use crate::error::StoreError;
use crate::model::{Entity, IdentityKey, Value};
use crate::query::{Navigation, Predicate};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod delegate;
pub mod memory;
pub mod sqlite;

pub use delegate::DelegateAdapter;
pub use memory::{InMemoryAdapter, KeyStrategy, Operation, OperationKind};
pub use sqlite::SqliteAdapter;

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Error raised by adapter implementations.
#[derive(Debug)]
pub enum AdapterError {
    Db(DbError),
    /// Update or delete addressed a row that does not exist.
    NotFound(IdentityKey),
    /// Create addressed a row whose identity is already stored.
    Duplicate(IdentityKey),
    Unsupported(String),
    InvalidData(String),
    TypeMismatch { expected: &'static str },
    /// Relation resolution failed while evaluating a predicate.
    Navigation(Box<StoreError>),
}

impl Display for AdapterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(key) => write!(f, "row not found: {key}"),
            Self::Duplicate(key) => write!(f, "row already exists: {key}"),
            Self::Unsupported(message) => write!(f, "unsupported operation: {message}"),
            Self::InvalidData(message) => write!(f, "invalid stored data: {message}"),
            Self::TypeMismatch { expected } => {
                write!(f, "adapter received an entity that is not `{expected}`")
            }
            Self::Navigation(err) => write!(f, "relation navigation failed: {err}"),
        }
    }
}

impl Error for AdapterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Navigation(err) => Some(err.as_ref()),
            Self::NotFound(_)
            | Self::Duplicate(_)
            | Self::Unsupported(_)
            | Self::InvalidData(_)
            | Self::TypeMismatch { .. } => None,
        }
    }
}

impl From<DbError> for AdapterError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for AdapterError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<StoreError> for AdapterError {
    fn from(value: StoreError) -> Self {
        Self::Navigation(Box::new(value))
    }
}

/// Read side of an adapter.
pub trait QueryAdapter<T: Entity> {
    /// Identity of `entity` as the storage sees it.
    fn identity(&self, entity: &T) -> IdentityKey;

    /// Returns every stored entity matching `predicate`.
    ///
    /// `navigation` resolves `Predicate::Related` nodes; adapters that can
    /// push relation predicates down may ignore it.
    fn execute_predicate(
        &self,
        predicate: &Predicate,
        navigation: &dyn Navigation,
    ) -> AdapterResult<Vec<T>>;

    /// Runs a named or raw storage command with positional parameters.
    fn execute_command(&self, command: &str, parameters: &[Value]) -> AdapterResult<Vec<T>>;
}

/// Storage statement plus its positional parameters.
///
/// The text is adapter specific: SQL for `SqliteAdapter`, a registered
/// name for `InMemoryAdapter`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    text: String,
    parameters: Vec<Value>,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(text: impl Into<String>, parameters: impl IntoIterator<Item = Value>) -> Self {
        Self {
            text: text.into(),
            parameters: parameters.into_iter().collect(),
        }
    }

    /// Appends one positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.parameters.push(value.into());
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} parameters)", self.text, self.parameters.len())
    }
}

/// Non-query side of an adapter.
pub trait CommandAdapter {
    /// Runs `command` and returns how many stored rows it affected.
    fn execute_non_query(&self, command: &Command) -> AdapterResult<usize>;
}

/// Write side of an adapter plus access to its read side.
pub trait CrudAdapter<T: Entity> {
    fn create(&self, entity: &mut T) -> AdapterResult<()>;
    fn update(&self, entity: &T) -> AdapterResult<()>;
    fn delete(&self, entity: &T) -> AdapterResult<()>;
    fn read(&self) -> &dyn QueryAdapter<T>;
}
