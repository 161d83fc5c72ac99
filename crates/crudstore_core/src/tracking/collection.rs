//! Relation slots and lazily loaded tracked collections.
//!
//! # Invariants
//! - A collection's predicate is fixed at creation from the owner's
//!   original key values; loading runs it at most once.
//! - Adding an item yields a `New` mark linked to the owner; removing one
//!   yields a `Deleted` mark that unlinks it.
//! - Assigned relations replace the lazy slot and are reconciled by change
//!   detection.

use crate::model::EntityType;
use crate::query::Predicate;
use crate::tracking::arena::EntityId;
use crate::tracking::entry::{EntryHooks, EntryState, RelationLink};

/// Entry-table action requested by a collection edit.
#[derive(Debug, Clone)]
pub(crate) struct PendingMark {
    pub(crate) entity: EntityId,
    pub(crate) state: EntryState,
    pub(crate) hooks: EntryHooks,
}

/// Lazily loaded collection bound to one owner relation.
#[derive(Debug, Clone)]
pub struct TrackedCollection {
    link: RelationLink,
    related: EntityType,
    query: Predicate,
    items: Option<Vec<EntityId>>,
}

impl TrackedCollection {
    pub(crate) fn new(link: RelationLink, related: EntityType, query: Predicate) -> Self {
        Self {
            link,
            related,
            query,
            items: None,
        }
    }

    pub fn related(&self) -> EntityType {
        self.related
    }

    pub fn query(&self) -> &Predicate {
        &self.query
    }

    pub fn is_loaded(&self) -> bool {
        self.items.is_some()
    }

    pub fn items(&self) -> Option<&[EntityId]> {
        self.items.as_deref()
    }

    pub(crate) fn set_loaded(&mut self, items: Vec<EntityId>) {
        self.items = Some(items);
    }

    /// Appends `item`; `None` when it is already present.
    pub(crate) fn add(&mut self, item: EntityId) -> Option<PendingMark> {
        let items = self.items.get_or_insert_with(Vec::new);
        if items.contains(&item) {
            return None;
        }
        items.push(item);
        Some(PendingMark {
            entity: item,
            state: EntryState::New,
            hooks: EntryHooks::link(self.link.clone()),
        })
    }

    /// Removes `item`; `None` when it is not present.
    pub(crate) fn remove(&mut self, item: EntityId) -> Option<PendingMark> {
        let items = self.items.as_mut()?;
        let position = items.iter().position(|candidate| *candidate == item)?;
        items.remove(position);
        Some(PendingMark {
            entity: item,
            state: EntryState::Deleted,
            hooks: EntryHooks::unlink(self.link.clone()),
        })
    }
}

/// Caller-assigned relation value awaiting change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Assigned {
    One(Option<EntityId>),
    Many(Vec<EntityId>),
}

/// Cached state of one relation field of a proxy.
#[derive(Debug, Clone)]
pub(crate) enum RelationSlot {
    Reference(Option<EntityId>),
    Collection(TrackedCollection),
    Assigned(Assigned),
}

#[cfg(test)]
mod tests {
    use super::TrackedCollection;
    use crate::model::EntityType;
    use crate::query::Predicate;
    use crate::tracking::arena::Arena;
    use crate::tracking::entry::{CommitHook, EntryState, RelationLink};
    use crate::tracking::proxy::{LazyEntity, ModelCache};

    #[derive(Debug, Clone, Default)]
    struct Line {
        id: i64,
    }

    crate::entity_fields!(Line as "line" => [id]);

    #[test]
    fn edits_produce_linked_marks() {
        let model = ModelCache::new().model_for::<Line>().expect("line model");
        let mut arena = Arena::default();
        let owner = arena.insert(Box::new(LazyEntity::detached(model.clone(), Line { id: 1 })));
        let item = arena.insert(Box::new(LazyEntity::detached(model, Line { id: 2 })));

        let mut collection = TrackedCollection::new(
            RelationLink::new(owner, EntityType::of::<Line>(), "lines"),
            EntityType::of::<Line>(),
            Predicate::eq("order_id", 1),
        );
        assert!(!collection.is_loaded());
        assert!(collection.remove(item).is_none());

        let added = collection.add(item).expect("first add marks");
        assert_eq!(added.state, EntryState::New);
        assert!(matches!(added.hooks.on_commit, CommitHook::Link(_)));
        assert!(collection.add(item).is_none());

        let removed = collection.remove(item).expect("remove marks");
        assert_eq!(removed.state, EntryState::Deleted);
        assert!(matches!(removed.hooks.on_commit, CommitHook::Unlink(_)));
        assert_eq!(collection.items(), Some(&[][..]));
    }
}
