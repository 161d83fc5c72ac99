//! Lifecycle notifications raised by a unit of work.

use crate::tracking::arena::EntityHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A new proxy was created for a stored row.
    Materialized,
    /// Raised before the adapter's create call.
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub entity: EntityHandle,
}

pub(crate) type Observer = Box<dyn FnMut(&Notification)>;
