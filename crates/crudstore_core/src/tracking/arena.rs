//! Handles and storage for tracked entities.
//!
//! # Invariants
//! - A freed slot bumps its generation, so handles issued before the free
//!   never resolve again, even after the slot is reused.
//! - Freed slots are reused before the slot vector grows.

use crate::model::{Entity, EntityType};
use crate::tracking::proxy::{LazyEntity, TrackedEntity};
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Slot position plus the generation the slot had when the entity was
/// tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    index: usize,
    generation: u32,
}

impl EntityId {
    pub fn index(self) -> usize {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.index, self.generation)
    }
}

/// Typed handle to a tracked entity of type `T`.
///
/// Valid only for the unit of work that produced it.
pub struct EntityRef<T> {
    id: EntityId,
    _entity: PhantomData<fn() -> T>,
}

impl<T> EntityRef<T> {
    pub(crate) fn new(id: EntityId) -> Self {
        Self {
            id,
            _entity: PhantomData,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }
}

impl<T> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for EntityRef<T> {}

impl<T> PartialEq for EntityRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for EntityRef<T> {}

impl<T> Hash for EntityRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> From<EntityRef<T>> for EntityId {
    fn from(value: EntityRef<T>) -> Self {
        value.id
    }
}

impl<T> Debug for EntityRef<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntityRef({})", self.id)
    }
}

/// Untyped handle carried by notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle {
    pub id: EntityId,
    pub entity_type: EntityType,
}

impl EntityHandle {
    /// Typed view when the handle refers to a `T`.
    pub fn downcast<T: Entity>(self) -> Option<EntityRef<T>> {
        self.entity_type.is::<T>().then(|| EntityRef::new(self.id))
    }
}

struct Slot {
    generation: u32,
    entity: Option<Box<dyn TrackedEntity>>,
}

#[derive(Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
}

impl Arena {
    pub(crate) fn insert(&mut self, entity: Box<dyn TrackedEntity>) -> EntityId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.entity = Some(entity);
            return EntityId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            entity: Some(entity),
        });
        EntityId {
            index: self.slots.len() - 1,
            generation: 0,
        }
    }

    fn slot(&self, id: EntityId) -> Option<&Slot> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
    }

    pub(crate) fn get(&self, id: EntityId) -> Option<&(dyn TrackedEntity + 'static)> {
        self.slot(id)?.entity.as_deref()
    }

    pub(crate) fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn TrackedEntity>> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)?
            .entity
            .as_mut()
    }

    pub(crate) fn typed<T: Entity>(&self, id: EntityId) -> Option<&LazyEntity<T>> {
        self.get(id)?.as_any().downcast_ref()
    }

    pub(crate) fn typed_mut<T: Entity>(&mut self, id: EntityId) -> Option<&mut LazyEntity<T>> {
        self.get_mut(id)?.as_any_mut().downcast_mut()
    }

    /// Live entities.
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Frees every live slot; capacity is kept for reuse.
    pub(crate) fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entity.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
            }
        }
        self.live = 0;
    }
}
