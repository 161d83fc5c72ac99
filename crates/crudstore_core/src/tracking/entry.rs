//! Entry table: pending persistence actions keyed by tracked entity.
//!
//! # Responsibility
//! - Hold at most one entry per entity with its state and commit hooks.
//! - Choose the next entry to commit.
//!
//! # Invariants
//! - Re-marking an entity replaces its state and hooks; the resolved source
//!   identity is kept.
//! - States order as `New < Modified < Deleted < Committed`; commit always
//!   works on the lowest uncommitted state first.

use crate::error::StoreResult;
use crate::model::{EntityType, IdentityKey};
use crate::tracking::arena::EntityId;
use crate::tracking::unit_of_work::UnitOfWork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    New = 1,
    Modified,
    Deleted,
    Committed,
}

/// The owner side of a relation an entry was marked through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationLink {
    pub owner: EntityId,
    pub owner_type: EntityType,
    pub field: String,
}

impl RelationLink {
    pub fn new(owner: EntityId, owner_type: EntityType, field: impl Into<String>) -> Self {
        Self {
            owner,
            owner_type,
            field: field.into(),
        }
    }
}

pub type HookFn = Rc<dyn Fn(&mut UnitOfWork, EntityId) -> StoreResult<()>>;

/// Action run around the adapter call of one entry.
#[derive(Clone, Default)]
pub enum CommitHook {
    #[default]
    None,
    /// Copy the owner's join keys into the entity; for many-to-many
    /// bindings insert the join row when the entity already exists.
    Link(RelationLink),
    /// Insert the many-to-many join row once the entity has been created.
    LinkJoin(RelationLink),
    /// Remove the many-to-many join row before the entity is deleted.
    Unlink(RelationLink),
    Custom(HookFn),
}

impl Debug for CommitHook {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Link(link) => f.debug_tuple("Link").field(link).finish(),
            Self::LinkJoin(link) => f.debug_tuple("LinkJoin").field(link).finish(),
            Self::Unlink(link) => f.debug_tuple("Unlink").field(link).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Pre- and post-commit hooks of one entry.
#[derive(Debug, Clone, Default)]
pub struct EntryHooks {
    pub on_commit: CommitHook,
    pub on_committed: CommitHook,
}

impl EntryHooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn custom(
        on_commit: impl Fn(&mut UnitOfWork, EntityId) -> StoreResult<()> + 'static,
        on_committed: impl Fn(&mut UnitOfWork, EntityId) -> StoreResult<()> + 'static,
    ) -> Self {
        Self {
            on_commit: CommitHook::Custom(Rc::new(on_commit)),
            on_committed: CommitHook::Custom(Rc::new(on_committed)),
        }
    }

    pub fn before_commit(
        on_commit: impl Fn(&mut UnitOfWork, EntityId) -> StoreResult<()> + 'static,
    ) -> Self {
        Self {
            on_commit: CommitHook::Custom(Rc::new(on_commit)),
            on_committed: CommitHook::None,
        }
    }

    /// Runs once the entry is stored and already reads as `Committed`.
    pub fn after_commit(
        on_committed: impl Fn(&mut UnitOfWork, EntityId) -> StoreResult<()> + 'static,
    ) -> Self {
        Self {
            on_commit: CommitHook::None,
            on_committed: CommitHook::Custom(Rc::new(on_committed)),
        }
    }

    pub(crate) fn link(link: RelationLink) -> Self {
        Self {
            on_commit: CommitHook::Link(link.clone()),
            on_committed: CommitHook::LinkJoin(link),
        }
    }

    pub(crate) fn unlink(link: RelationLink) -> Self {
        Self {
            on_commit: CommitHook::Unlink(link),
            on_committed: CommitHook::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    state: EntryState,
    entity: EntityId,
    entity_type: EntityType,
    source: Option<IdentityKey>,
    hooks: EntryHooks,
    revisits: usize,
}

impl Entry {
    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Stored identity the entity was materialized from, if any.
    pub fn source(&self) -> Option<&IdentityKey> {
        self.source.as_ref()
    }

    fn waits_on(&self) -> Option<EntityId> {
        match &self.hooks.on_commit {
            CommitHook::Link(link) if link.owner != self.entity => Some(link.owner),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct EntryTable {
    entries: Vec<Entry>,
    index: HashMap<EntityId, usize>,
}

impl EntryTable {
    /// Creates or re-marks the entry of `entity`; returns `true` when a new
    /// entry was created.
    pub(crate) fn mark(
        &mut self,
        entity: EntityId,
        entity_type: EntityType,
        state: EntryState,
        source: Option<IdentityKey>,
        hooks: EntryHooks,
    ) -> bool {
        if let Some(&position) = self.index.get(&entity) {
            let entry = &mut self.entries[position];
            entry.state = state;
            entry.hooks = hooks;
            return false;
        }
        self.index.insert(entity, self.entries.len());
        self.entries.push(Entry {
            state,
            entity,
            entity_type,
            source,
            hooks,
            revisits: 0,
        });
        true
    }

    pub(crate) fn get(&self, entity: EntityId) -> Option<&Entry> {
        self.index
            .get(&entity)
            .and_then(|&position| self.entries.get(position))
    }

    fn get_mut(&mut self, entity: EntityId) -> Option<&mut Entry> {
        let position = *self.index.get(&entity)?;
        self.entries.get_mut(position)
    }

    pub(crate) fn state(&self, entity: EntityId) -> Option<EntryState> {
        self.get(entity).map(|entry| entry.state)
    }

    pub(crate) fn contains(&self, entity: EntityId) -> bool {
        self.index.contains_key(&entity)
    }

    pub(crate) fn ids_in(&self, states: &[EntryState]) -> Vec<EntityId> {
        self.entries
            .iter()
            .filter(|entry| states.contains(&entry.state))
            .map(|entry| entry.entity)
            .collect()
    }

    /// Next entry to commit: lowest uncommitted state, insertion order,
    /// preferring entries whose linked owner is not itself still new.
    pub(crate) fn next_pending(&self) -> Option<EntityId> {
        let lowest = self
            .entries
            .iter()
            .map(|entry| entry.state)
            .filter(|state| *state != EntryState::Committed)
            .min()?;
        let candidates: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|entry| entry.state == lowest)
            .collect();
        candidates
            .iter()
            .find(|entry| {
                entry
                    .waits_on()
                    .map_or(true, |owner| self.state(owner) != Some(EntryState::New))
            })
            .or_else(|| candidates.first())
            .map(|entry| entry.entity)
    }

    pub(crate) fn take_on_commit(&mut self, entity: EntityId) -> CommitHook {
        self.get_mut(entity)
            .map(|entry| std::mem::take(&mut entry.hooks.on_commit))
            .unwrap_or_default()
    }

    pub(crate) fn take_on_committed(&mut self, entity: EntityId) -> CommitHook {
        self.get_mut(entity)
            .map(|entry| std::mem::take(&mut entry.hooks.on_committed))
            .unwrap_or_default()
    }

    /// Counts a state change made by a pre-commit hook.
    pub(crate) fn record_revisit(&mut self, entity: EntityId) -> usize {
        match self.get_mut(entity) {
            Some(entry) => {
                entry.revisits += 1;
                entry.revisits
            }
            None => 0,
        }
    }

    pub(crate) fn complete(&mut self, entity: EntityId) {
        if let Some(entry) = self.get_mut(entity) {
            entry.state = EntryState::Committed;
            entry.hooks = EntryHooks::none();
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{CommitHook, EntryHooks, EntryState, EntryTable, RelationLink};
    use crate::model::EntityType;
    use crate::tracking::arena::Arena;
    use crate::tracking::proxy::{LazyEntity, ModelCache};

    #[derive(Debug, Clone, Default)]
    struct Node {
        id: i64,
    }

    crate::entity_fields!(Node as "node" => [id]);

    fn ids(count: usize) -> Vec<crate::tracking::EntityId> {
        let model = ModelCache::new().model_for::<Node>().expect("node model");
        let mut arena = Arena::default();
        (0..count)
            .map(|index| {
                arena.insert(Box::new(LazyEntity::detached(
                    model.clone(),
                    Node { id: index as i64 },
                )))
            })
            .collect()
    }

    fn node() -> EntityType {
        EntityType::of::<Node>()
    }

    #[test]
    fn lowest_state_is_selected_first() {
        let ids = ids(3);
        let mut table = EntryTable::default();
        table.mark(ids[0], node(), EntryState::Deleted, None, EntryHooks::none());
        table.mark(ids[1], node(), EntryState::Modified, None, EntryHooks::none());
        table.mark(ids[2], node(), EntryState::New, None, EntryHooks::none());

        assert_eq!(table.next_pending(), Some(ids[2]));
        table.complete(ids[2]);
        assert_eq!(table.next_pending(), Some(ids[1]));
        table.complete(ids[1]);
        assert_eq!(table.next_pending(), Some(ids[0]));
        table.complete(ids[0]);
        assert_eq!(table.next_pending(), None);
    }

    #[test]
    fn remarking_replaces_state_and_hooks() {
        let ids = ids(2);
        let mut table = EntryTable::default();
        let link = RelationLink::new(ids[1], node(), "children");
        assert!(table.mark(ids[0], node(), EntryState::New, None, EntryHooks::link(link)));
        assert!(!table.mark(ids[0], node(), EntryState::Modified, None, EntryHooks::none()));

        assert_eq!(table.len(), 1);
        assert_eq!(table.state(ids[0]), Some(EntryState::Modified));
        assert!(matches!(table.take_on_commit(ids[0]), CommitHook::None));
    }

    #[test]
    fn new_children_wait_for_new_owners() {
        let ids = ids(2);
        let mut table = EntryTable::default();
        let link = RelationLink::new(ids[1], node(), "children");
        table.mark(ids[0], node(), EntryState::New, None, EntryHooks::link(link));
        table.mark(ids[1], node(), EntryState::New, None, EntryHooks::none());

        assert_eq!(table.next_pending(), Some(ids[1]));
        table.complete(ids[1]);
        assert_eq!(table.next_pending(), Some(ids[0]));
    }

    #[test]
    fn hooks_are_taken_once() {
        let ids = ids(2);
        let mut table = EntryTable::default();
        let link = RelationLink::new(ids[1], node(), "tags");
        table.mark(ids[0], node(), EntryState::New, None, EntryHooks::link(link));

        assert!(matches!(table.take_on_commit(ids[0]), CommitHook::Link(_)));
        assert!(matches!(table.take_on_commit(ids[0]), CommitHook::None));
        assert!(matches!(table.take_on_committed(ids[0]), CommitHook::LinkJoin(_)));
        assert_eq!(table.record_revisit(ids[0]), 1);
    }
}
