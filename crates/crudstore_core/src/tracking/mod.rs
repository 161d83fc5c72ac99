//! Change tracking: proxies, identity map, entry table and commit.
//!
//! # Responsibility
//! - Own every tracked entity of a unit of work in an arena and hand out
//!   typed handles.
//! - Route persistence through registered adapters in dependency order.
//!
//! # See also
//! - crate::mapping for the relation bindings resolved here.
//! - crate::query::Query for deferred loads into a unit of work.

mod arena;
mod collection;
mod entry;
mod events;
mod identity;
mod proxy;
mod registry;
mod unit_of_work;

pub use arena::{EntityHandle, EntityId, EntityRef};
pub use collection::TrackedCollection;
pub use entry::{CommitHook, Entry, EntryHooks, EntryState, HookFn, RelationLink};
pub use events::{Notification, NotificationKind};
pub use proxy::{EntityModel, LazyEntity, ModelCache, ModelError};
pub use registry::DataStore;
pub use unit_of_work::{CommitReport, CommittedEntry, UnitOfWork};
