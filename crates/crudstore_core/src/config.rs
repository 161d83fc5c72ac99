//! Unit-of-work settings.
//!
//! # Invariants
//! - Every field has a default, so partial documents deserialize.
//! - Limits are upper bounds on commit work, never tuning knobs for
//!   ordering.

use serde::{Deserialize, Serialize};

/// What commit does with an entry whose type has no registered adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnregisteredPolicy {
    /// Mark the entry committed without storage access and log a warning.
    #[default]
    Skip,
    /// Abort the commit with `StoreError::NotRegistered`.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOfWorkOptions {
    /// Times a pre-commit hook may change one entry's state before the
    /// commit fails with `StoreError::NoProgress`.
    pub max_entry_revisits: usize,
    /// Upper bound on selection passes in one commit.
    pub max_commit_passes: usize,
    pub unregistered: UnregisteredPolicy,
}

impl Default for UnitOfWorkOptions {
    fn default() -> Self {
        Self {
            max_entry_revisits: 16,
            max_commit_passes: 100_000,
            unregistered: UnregisteredPolicy::Skip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{UnitOfWorkOptions, UnregisteredPolicy};

    #[test]
    fn partial_documents_keep_defaults() {
        let options: UnitOfWorkOptions =
            serde_json::from_str(r#"{"unregistered":"error"}"#).expect("parse options");
        assert_eq!(options.unregistered, UnregisteredPolicy::Error);
        assert_eq!(options.max_entry_revisits, 16);
        assert_eq!(options.max_commit_passes, 100_000);
    }

    #[test]
    fn options_serialize_with_snake_case_policy() {
        let json = serde_json::to_value(UnitOfWorkOptions::default()).expect("serialize options");
        assert_eq!(json["unregistered"], "skip");
    }
}
