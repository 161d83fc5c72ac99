//! Error type for unit-of-work, mapping and query operations.

use crate::adapter::AdapterError;
use crate::tracking::{EntityId, EntryState, ModelError};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    /// No adapter is registered for the entity type.
    NotRegistered(&'static str),
    Adapter {
        entity: &'static str,
        source: AdapterError,
    },
    Model(ModelError),
    /// The handle does not belong to this unit of work.
    UnknownEntity(EntityId),
    RelationNotMapped {
        entity: &'static str,
        field: String,
    },
    /// The relation exists but has a different cardinality or target type.
    RelationMismatch {
        entity: &'static str,
        field: String,
        message: String,
    },
    /// Entries cannot be explicitly marked as committed.
    InvalidMark(EntryState),
    /// Pre-commit hooks kept changing an entry's state.
    NoProgress {
        entity: EntityId,
        state: EntryState,
        revisits: usize,
    },
    CommitPassLimit(usize),
    /// A command was executed without a command adapter configured.
    NoCommandTarget,
    Command(AdapterError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRegistered(entity) => write!(f, "no adapter registered for `{entity}`"),
            Self::Adapter { entity, source } => write!(f, "adapter for `{entity}` failed: {source}"),
            Self::Model(err) => write!(f, "{err}"),
            Self::UnknownEntity(id) => write!(f, "entity {id} is not tracked by this unit of work"),
            Self::RelationNotMapped { entity, field } => {
                write!(f, "`{entity}.{field}` is not a mapped relation")
            }
            Self::RelationMismatch {
                entity,
                field,
                message,
            } => write!(f, "relation `{entity}.{field}` {message}"),
            Self::InvalidMark(state) => write!(f, "entries cannot be marked {state:?}"),
            Self::NoProgress {
                entity,
                state,
                revisits,
            } => write!(
                f,
                "entry {entity} changed state {revisits} times without committing (last {state:?})"
            ),
            Self::CommitPassLimit(limit) => {
                write!(f, "commit did not finish within {limit} passes")
            }
            Self::NoCommandTarget => write!(f, "no command adapter is configured"),
            Self::Command(source) => write!(f, "command failed: {source}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Adapter { source, .. } | Self::Command(source) => Some(source),
            Self::Model(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ModelError> for StoreError {
    fn from(value: ModelError) -> Self {
        Self::Model(value)
    }
}
