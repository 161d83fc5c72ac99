//! Core change-tracking and lazy-materialization engine for crudstore.
//! Storage stays behind adapters; this crate owns identity, relations and
//! commit ordering.

pub mod adapter;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod mapping;
pub mod model;
pub mod query;
pub mod tracking;

pub use adapter::{
    AdapterError, AdapterResult, Command, CommandAdapter, CrudAdapter, DelegateAdapter,
    InMemoryAdapter, KeyStrategy, QueryAdapter, SqliteAdapter,
};
pub use config::{UnitOfWorkOptions, UnregisteredPolicy};
pub use context::{DataContext, QueryContext};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use error::{StoreError, StoreResult};
pub use logging::{default_log_level, init_logging, init_logging_with, logging_status, LoggingConfig};
pub use mapping::{Cardinality, Join, PropertyMap, RelationshipMap};
pub use model::{Entity, EntityType, Field, IdentityKey, Row, Value};
pub use query::{Direction, Navigation, Predicate, Query, Specification};
pub use tracking::{
    CommitReport, CommittedEntry, EntityId, EntityRef, EntryHooks, EntryState, Notification, NotificationKind,
    UnitOfWork,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
