//! Identity map: one proxy per stored identity within a unit of work.

use crate::model::{EntityType, IdentityKey};
use crate::tracking::arena::EntityId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct IdentityMap {
    by_key: HashMap<(EntityType, IdentityKey), EntityId>,
    by_entity: HashMap<EntityId, IdentityKey>,
    order: Vec<EntityId>,
}

impl IdentityMap {
    pub(crate) fn get(&self, entity_type: EntityType, key: &IdentityKey) -> Option<EntityId> {
        self.by_key.get(&(entity_type, key.clone())).copied()
    }

    /// Returns `false` and leaves the map unchanged when the identity is
    /// already mapped.
    pub(crate) fn insert(&mut self, entity_type: EntityType, key: IdentityKey, entity: EntityId) -> bool {
        if self.by_key.contains_key(&(entity_type, key.clone())) {
            return false;
        }
        self.by_key.insert((entity_type, key.clone()), entity);
        self.by_entity.insert(entity, key);
        self.order.push(entity);
        true
    }

    /// Reverse lookup: identity an entity was materialized from.
    pub(crate) fn key_of(&self, entity: EntityId) -> Option<&IdentityKey> {
        self.by_entity.get(&entity)
    }

    /// Materialized entities in materialization order.
    pub(crate) fn entities(&self) -> &[EntityId] {
        &self.order
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_key.clear();
        self.by_entity.clear();
        self.order.clear();
    }
}
