//! Predicates, specifications and deferred queries.
//!
//! # Responsibility
//! - Describe which entities to load (`Predicate`, `Specification`).
//! - Compose deferred queries that execute through a unit of work.
//! - Evaluate relation predicates through a navigation resolver.
//!
//! # See also
//! - crate::tracking::UnitOfWork::find

pub mod composer;
pub mod navigation;
pub mod predicate;
pub mod specification;

pub use composer::{Direction, Query};
pub use navigation::{rewrite, NavigablePredicate, Navigation, NoNavigation};
pub use predicate::{CompareOp, Comparison, Predicate};
pub use specification::{Criteria, Specification};
