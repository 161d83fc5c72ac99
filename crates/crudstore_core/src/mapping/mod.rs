//! Relationship map: which fields of an entity are relations and how they
//! join.
//!
//! # Responsibility
//! - Store one `Binding` per `(owner type, relation field)`.
//! - Record the join entity used by many-to-many pairs.
//! - Offer a typed builder (`PropertyMap`) for declaring bindings.
//!
//! # Invariants
//! - Registration is idempotent: the first binding for a key wins and later
//!   attempts are ignored.
//! - A `Join` pairs owner-side fields with related-side fields; for
//!   many-to-many bindings each side pairs with the join entity instead.
//!
//! # See also
//! - crate::tracking::registry for predicate construction from bindings.

use crate::model::{Entity, EntityType};
use crate::query::Predicate;
use log::debug;
use std::collections::HashMap;
use std::marker::PhantomData;

/// One equality pair of a join condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub left: String,
    pub right: String,
}

/// Equality join between two entity types, with an optional extra filter
/// on the right-hand side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Join {
    pairs: Vec<KeyPair>,
    filter: Option<Predicate>,
}

impl Join {
    /// `left.<left> == right.<right>`.
    pub fn on(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::default().and_on(left, right)
    }

    pub fn and_on(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.pairs.push(KeyPair {
            left: left.into(),
            right: right.into(),
        });
        self
    }

    /// Additional predicate over the right-hand entity.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn pairs(&self) -> &[KeyPair] {
        &self.pairs
    }

    pub fn extra_filter(&self) -> Option<&Predicate> {
        self.filter.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// Join entity of a many-to-many binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Through {
    pub join_entity: EntityType,
    /// Owner fields (left) to join-entity fields (right).
    pub owner_keys: Join,
    /// Related fields (left) to join-entity fields (right).
    pub related_keys: Join,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub owner: EntityType,
    pub related: EntityType,
    pub field: String,
    pub cardinality: Cardinality,
    /// Owner fields (left) to related fields (right). Empty for
    /// many-to-many bindings.
    pub join: Join,
    pub through: Option<Through>,
}

impl Binding {
    pub fn is_many_to_many(&self) -> bool {
        self.through.is_some()
    }
}

#[derive(Debug, Default)]
pub struct RelationshipMap {
    bindings: HashMap<(EntityType, String), Binding>,
    join_entities: HashMap<(EntityType, EntityType), EntityType>,
}

impl RelationshipMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when a binding for the same owner field exists.
    pub fn insert(&mut self, binding: Binding) -> bool {
        let key = (binding.owner, binding.field.clone());
        if self.bindings.contains_key(&key) {
            debug!(
                "event=relation_map module=mapping status=ignored entity={} field={}",
                binding.owner, binding.field
            );
            return false;
        }
        if let Some(through) = &binding.through {
            self.join_entities
                .entry((binding.owner, binding.related))
                .or_insert(through.join_entity);
        }
        debug!(
            "event=relation_map module=mapping status=ok entity={} field={} related={} cardinality={:?}",
            binding.owner, binding.field, binding.related, binding.cardinality
        );
        self.bindings.insert(key, binding);
        true
    }

    pub fn binding(&self, owner: EntityType, field: &str) -> Option<&Binding> {
        self.bindings.get(&(owner, field.to_string()))
    }

    /// Bindings of `owner`, sorted by field name.
    pub fn bindings_for(&self, owner: EntityType) -> Vec<&Binding> {
        let mut bindings: Vec<&Binding> = self
            .bindings
            .values()
            .filter(|binding| binding.owner == owner)
            .collect();
        bindings.sort_by(|left, right| left.field.cmp(&right.field));
        bindings
    }

    pub fn join_entity(&self, owner: EntityType, related: EntityType) -> Option<EntityType> {
        self.join_entities.get(&(owner, related)).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Typed builder for the relations of `T`.
pub struct PropertyMap<'a, T> {
    map: &'a mut RelationshipMap,
    _owner: PhantomData<fn() -> T>,
}

impl<'a, T: Entity> PropertyMap<'a, T> {
    pub fn new(map: &'a mut RelationshipMap) -> Self {
        Self {
            map,
            _owner: PhantomData,
        }
    }

    /// Single related entity. `join` pairs `T` fields with `R` fields.
    pub fn map_one<R: Entity>(self, field: &str, join: Join) -> Self {
        self.insert::<R>(field, Cardinality::One, join, None)
    }

    /// Collection of related entities. `join` pairs `T` fields with `R`
    /// fields.
    pub fn map_many<R: Entity>(self, field: &str, join: Join) -> Self {
        self.insert::<R>(field, Cardinality::Many, join, None)
    }

    /// Many-to-many collection through join entity `J`.
    pub fn map_through<R: Entity, J: Entity>(
        self,
        field: &str,
        owner_keys: Join,
        related_keys: Join,
    ) -> Self {
        let through = Through {
            join_entity: EntityType::of::<J>(),
            owner_keys,
            related_keys,
        };
        self.insert::<R>(field, Cardinality::Many, Join::default(), Some(through))
    }

    fn insert<R: Entity>(
        self,
        field: &str,
        cardinality: Cardinality,
        join: Join,
        through: Option<Through>,
    ) -> Self {
        self.map.insert(Binding {
            owner: EntityType::of::<T>(),
            related: EntityType::of::<R>(),
            field: field.to_string(),
            cardinality,
            join,
            through,
        });
        self
    }
}
