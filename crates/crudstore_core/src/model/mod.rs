//! Entity description layer shared by adapters, predicates and tracking.
//!
//! # Responsibility
//! - Define the `Entity` contract user types implement to be tracked.
//! - Provide the dynamic `Value` exchanged between fields and predicates.
//! - Provide hashable identity keys reported by adapters.
//!
//! # Invariants
//! - Field manifests are static and declared once per entity type.
//! - `IdentityKey` equality is structural; floats compare by bit pattern.
//!
//! # See also
//! - crate::tracking::proxy for the per-type model built from a manifest.

pub mod entity;
pub mod key;
pub mod value;

pub use entity::{field, set_field, Entity, EntityType, Field, Row};
pub use key::IdentityKey;
pub use value::{FromValue, Value};
