//! Unit of work: identity map, entry table and commit loop.
//!
//! # Responsibility
//! - Materialize stored rows into tracked proxies, one per identity.
//! - Resolve relations on first access and track collection edits.
//! - Detect changes and commit pending entries in dependency-safe order.
//!
//! # Invariants
//! - Within one unit of work an identity maps to exactly one `EntityId`
//!   until commit or disposal clears the map.
//! - Writes never mark entries; only explicit marks and change detection
//!   do.
//! - A successful commit leaves the entry table, identity map and arena
//!   empty; a failed one leaves all three intact for inspection.
//! - Handles issued before a successful commit or `dispose` no longer
//!   resolve, even once their slots are reused.
//!
//! # See also
//! - crate::tracking::registry for adapter dispatch and relation predicates.

use crate::adapter::{AdapterError, Command, CommandAdapter, CrudAdapter};
use crate::config::{UnitOfWorkOptions, UnregisteredPolicy};
use crate::error::{StoreError, StoreResult};
use crate::mapping::{Binding, Cardinality, PropertyMap, Through};
use crate::model::{Entity, EntityType, IdentityKey, Row, Value};
use crate::query::{CompareOp, Comparison, Navigation, Predicate, Query, Specification};
use crate::tracking::arena::{Arena, EntityHandle, EntityId, EntityRef};
use crate::tracking::collection::{Assigned, PendingMark, RelationSlot, TrackedCollection};
use crate::tracking::entry::{CommitHook, Entry, EntryHooks, EntryState, EntryTable, RelationLink};
use crate::tracking::events::{Notification, NotificationKind, Observer};
use crate::tracking::identity::IdentityMap;
use crate::tracking::proxy::{LazyEntity, ModelCache, TrackedEntity};
use crate::tracking::registry::Registry;
use log::{debug, error, info, warn};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

/// One persisted entry reported by `UnitOfWork::commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    /// Handle at commit time; it no longer resolves once commit returns.
    pub entity: EntityId,
    pub entity_type: &'static str,
    /// Stored identity after the adapter call, including generated keys.
    pub key: IdentityKey,
    pub operation: EntryState,
}

/// Summary of one successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Entries completed without storage access because their type has no
    /// adapter.
    pub skipped: usize,
    /// Adapter calls in the order they were made.
    pub committed: Vec<CommittedEntry>,
}

impl CommitReport {
    fn record(
        &mut self,
        entity: EntityId,
        entity_type: EntityType,
        key: IdentityKey,
        operation: EntryState,
    ) {
        match operation {
            EntryState::New => self.created += 1,
            EntryState::Modified => self.updated += 1,
            EntryState::Deleted => self.deleted += 1,
            EntryState::Committed => {}
        }
        self.committed.push(CommittedEntry {
            entity,
            entity_type: entity_type.name(),
            key,
            operation,
        });
    }
}

pub struct UnitOfWork {
    session: Uuid,
    options: UnitOfWorkOptions,
    models: Arc<ModelCache>,
    registry: Registry,
    arena: Arena,
    identity: IdentityMap,
    entries: EntryTable,
    observers: Vec<Observer>,
    commands: Option<Rc<dyn CommandAdapter>>,
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::with_options(UnitOfWorkOptions::default())
    }

    pub fn with_options(options: UnitOfWorkOptions) -> Self {
        Self {
            session: Uuid::new_v4(),
            options,
            models: ModelCache::global(),
            registry: Registry::default(),
            arena: Arena::default(),
            identity: IdentityMap::default(),
            entries: EntryTable::default(),
            observers: Vec::new(),
            commands: None,
        }
    }

    /// Replaces the process-wide model cache with `models`.
    pub fn with_model_cache(mut self, models: Arc<ModelCache>) -> Self {
        self.models = models;
        self
    }

    /// Routes `execute_command` to `commands`.
    pub fn with_command_target(mut self, commands: Rc<dyn CommandAdapter>) -> Self {
        self.set_command_target(commands);
        self
    }

    pub fn set_command_target(&mut self, commands: Rc<dyn CommandAdapter>) {
        self.commands = Some(commands);
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn options(&self) -> &UnitOfWorkOptions {
        &self.options
    }

    /// Registers the adapter for `T` and returns its relation mapper.
    ///
    /// The first registration of a type wins; later adapters are ignored.
    pub fn register<T: Entity>(&mut self, adapter: Rc<dyn CrudAdapter<T>>) -> PropertyMap<'_, T> {
        let added = self.registry.register(adapter);
        info!(
            "event=uow_register module=tracking status={} session={} entity={}",
            if added { "ok" } else { "skip" },
            self.session,
            T::NAME
        );
        PropertyMap::new(&mut self.registry.relationships)
    }

    /// Relation mapper for `T` without registering an adapter.
    pub fn map<T: Entity>(&mut self) -> PropertyMap<'_, T> {
        PropertyMap::new(&mut self.registry.relationships)
    }

    pub fn is_registered<T: Entity>(&self) -> bool {
        self.registry.contains(EntityType::of::<T>())
    }

    /// Resolver for relation fields on raw rows.
    pub fn navigation(&self) -> &dyn Navigation {
        &self.registry
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&Notification) + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Deferred query over `T`; nothing runs until a terminal operation.
    pub fn find<T: Entity>(&self, specification: impl Into<Specification<T>>) -> Query<T> {
        Query::new(specification.into())
    }

    pub fn find_single<T: Entity>(
        &mut self,
        specification: impl Into<Specification<T>>,
    ) -> StoreResult<Option<EntityRef<T>>> {
        Query::new(specification.into()).first(self)
    }

    pub(crate) fn execute<T: Entity>(&mut self, query: &Query<T>) -> StoreResult<Vec<EntityRef<T>>> {
        let model = self.models.model_for::<T>()?;
        let store = self.registry.store::<T>()?;
        let rows = store
            .fetch(query.specification(), &self.registry)
            .map_err(adapter_failure(T::NAME))?;
        let keyed: Vec<(IdentityKey, T)> = rows
            .into_iter()
            .map(|row| (store.identity(&row), row))
            .collect();

        let entity_type = EntityType::of::<T>();
        let before = self.identity.len();
        let mut ids = Vec::with_capacity(keyed.len());
        for (key, row) in keyed {
            let model = Arc::clone(&model);
            ids.push(self.adopt(entity_type, key, move || {
                Box::new(LazyEntity::materialized(model, row))
            }));
        }
        debug!(
            "event=uow_materialize module=tracking status=ok session={} entity={} rows={} new={}",
            self.session,
            T::NAME,
            ids.len(),
            self.identity.len() - before
        );

        let arena = &self.arena;
        let tracked: Vec<(EntityId, &dyn Row)> = ids
            .iter()
            .filter_map(|id| arena.get(*id).map(|slot| (*id, slot.current_row())))
            .collect();
        let refined = query
            .refine(tracked, |item| item.1, &self.registry)
            .map_err(adapter_failure(T::NAME))?;
        Ok(refined
            .into_iter()
            .map(|(id, _)| EntityRef::new(id))
            .collect())
    }

    // Returns the mapped proxy for `key`, creating it with `proxy` when the
    // identity is new.
    fn adopt(
        &mut self,
        entity_type: EntityType,
        key: IdentityKey,
        proxy: impl FnOnce() -> Box<dyn TrackedEntity>,
    ) -> EntityId {
        if let Some(existing) = self.identity.get(entity_type, &key) {
            return existing;
        }
        let id = self.arena.insert(proxy());
        self.identity.insert(entity_type, key, id);
        self.notify(NotificationKind::Materialized, id, entity_type);
        id
    }

    fn fetch_related(&mut self, related: EntityType, predicate: &Predicate) -> StoreResult<Vec<EntityId>> {
        let Some(store) = self.registry.erased(related) else {
            return Ok(Vec::new());
        };
        let tracked = store.fetch_tracked(predicate, &self.registry, &self.models)?;
        Ok(tracked
            .into_iter()
            .map(|(key, slot)| self.adopt(related, key, move || slot))
            .collect())
    }

    pub fn get<T: Entity>(&self, entity: EntityRef<T>) -> Option<&T> {
        self.arena.typed::<T>(entity.id()).map(LazyEntity::current)
    }

    pub fn get_mut<T: Entity>(&mut self, entity: EntityRef<T>) -> Option<&mut T> {
        self.arena
            .typed_mut::<T>(entity.id())
            .map(LazyEntity::current_mut)
    }

    /// Row as it was materialized; `None` for entities created in memory.
    pub fn original<T: Entity>(&self, entity: EntityRef<T>) -> Option<&T> {
        self.arena.typed::<T>(entity.id())?.original()
    }

    pub fn read(&self, entity: impl Into<EntityId>, field: &str) -> Option<Value> {
        self.arena.get(entity.into())?.read(field)
    }

    /// Writes one scalar field; `Ok(false)` when the field rejects the value.
    pub fn write(
        &mut self,
        entity: impl Into<EntityId>,
        field: &str,
        value: impl Into<Value>,
    ) -> StoreResult<bool> {
        Ok(self.slot_mut(entity.into())?.write(field, value.into()))
    }

    /// Tracks `entity` without marking it.
    pub fn attach<T: Entity>(&mut self, entity: T) -> StoreResult<EntityRef<T>> {
        let model = self.models.model_for::<T>()?;
        let id = self.arena.insert(Box::new(LazyEntity::detached(model, entity)));
        Ok(EntityRef::new(id))
    }

    /// Tracks `entity` and marks it `New`.
    pub fn add<T: Entity>(&mut self, entity: T) -> StoreResult<EntityRef<T>> {
        let entity = self.attach(entity)?;
        self.mark_new(entity)?;
        Ok(entity)
    }

    fn slot(&self, entity: EntityId) -> StoreResult<&dyn TrackedEntity> {
        self.arena
            .get(entity)
            .ok_or(StoreError::UnknownEntity(entity))
    }

    fn slot_mut(&mut self, entity: EntityId) -> StoreResult<&mut Box<dyn TrackedEntity>> {
        self.arena
            .get_mut(entity)
            .ok_or(StoreError::UnknownEntity(entity))
    }

    pub fn mark_new(&mut self, entity: impl Into<EntityId>) -> StoreResult<()> {
        self.mark_with(entity, EntryState::New, EntryHooks::none())
    }

    pub fn mark_modified(&mut self, entity: impl Into<EntityId>) -> StoreResult<()> {
        self.mark_with(entity, EntryState::Modified, EntryHooks::none())
    }

    pub fn mark_deleted(&mut self, entity: impl Into<EntityId>) -> StoreResult<()> {
        self.mark_with(entity, EntryState::Deleted, EntryHooks::none())
    }

    /// Creates or re-marks the entry of `entity` with explicit hooks.
    pub fn mark_with(
        &mut self,
        entity: impl Into<EntityId>,
        state: EntryState,
        hooks: EntryHooks,
    ) -> StoreResult<()> {
        let entity = entity.into();
        if state == EntryState::Committed {
            return Err(StoreError::InvalidMark(state));
        }
        let entity_type = self.slot(entity)?.entity_type();
        let source = match state {
            EntryState::New => None,
            _ => self.identity.key_of(entity).cloned(),
        };
        self.entries.mark(entity, entity_type, state, source, hooks);
        Ok(())
    }

    fn apply(&mut self, mark: PendingMark) -> StoreResult<()> {
        self.mark_with(mark.entity, mark.state, mark.hooks)
    }

    pub fn state_of(&self, entity: impl Into<EntityId>) -> Option<EntryState> {
        self.entries.state(entity.into())
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Entities currently held by the identity map.
    pub fn materialized_count(&self) -> usize {
        self.identity.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.arena.len()
    }

    /// Single related entity behind `field`, loaded on first access.
    ///
    /// Unmapped fields resolve to `None`.
    pub fn reference<T: Entity, R: Entity>(
        &mut self,
        owner: EntityRef<T>,
        field: &str,
    ) -> StoreResult<Option<EntityRef<R>>> {
        let Some(binding) = self.typed_binding::<T, R>(field, Cardinality::One)? else {
            return Ok(None);
        };
        Ok(self
            .resolve_reference(owner.id(), &binding)?
            .map(EntityRef::new))
    }

    /// Tracked collection behind `field`. Creating it runs no query for
    /// direct bindings.
    pub fn collection<T: Entity, R: Entity>(
        &mut self,
        owner: EntityRef<T>,
        field: &str,
    ) -> StoreResult<Option<&TrackedCollection>> {
        let Some(binding) = self.typed_binding::<T, R>(field, Cardinality::Many)? else {
            return Ok(None);
        };
        self.ensure_collection(owner.id(), &binding)?;
        match self.relation(owner.id(), field)? {
            Some(RelationSlot::Collection(collection)) => Ok(Some(collection)),
            _ => Ok(None),
        }
    }

    /// Items of the collection behind `field`, loading it once.
    pub fn load_collection<T: Entity, R: Entity>(
        &mut self,
        owner: EntityRef<T>,
        field: &str,
    ) -> StoreResult<Vec<EntityRef<R>>> {
        let Some(binding) = self.typed_binding::<T, R>(field, Cardinality::Many)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .loaded_items(owner.id(), &binding)?
            .into_iter()
            .map(EntityRef::new)
            .collect())
    }

    /// Adds `item` to the collection and marks it `New` linked to `owner`.
    ///
    /// Returns `false` when the item is already present.
    pub fn collection_add<T: Entity, R: Entity>(
        &mut self,
        owner: EntityRef<T>,
        field: &str,
        item: EntityRef<R>,
    ) -> StoreResult<bool> {
        let binding = self.mapped_binding::<T, R>(field, Cardinality::Many)?;
        self.slot(item.id())?;
        self.loaded_items(owner.id(), &binding)?;
        let mark = match self.slot_mut(owner.id())?.relations_mut().get_mut(field) {
            Some(RelationSlot::Collection(collection)) => collection.add(item.id()),
            Some(RelationSlot::Assigned(Assigned::Many(items))) => {
                if items.contains(&item.id()) {
                    return Ok(false);
                }
                items.push(item.id());
                return Ok(true);
            }
            _ => None,
        };
        match mark {
            Some(mark) => self.apply(mark).map(|_| true),
            None => Ok(false),
        }
    }

    /// Removes `item` from the collection and marks it `Deleted`; its join
    /// row goes first for many-to-many bindings.
    pub fn collection_remove<T: Entity, R: Entity>(
        &mut self,
        owner: EntityRef<T>,
        field: &str,
        item: EntityRef<R>,
    ) -> StoreResult<bool> {
        let binding = self.mapped_binding::<T, R>(field, Cardinality::Many)?;
        self.loaded_items(owner.id(), &binding)?;
        let mark = match self.slot_mut(owner.id())?.relations_mut().get_mut(field) {
            Some(RelationSlot::Collection(collection)) => collection.remove(item.id()),
            Some(RelationSlot::Assigned(Assigned::Many(items))) => {
                let before = items.len();
                items.retain(|candidate| *candidate != item.id());
                return Ok(items.len() != before);
            }
            _ => None,
        };
        match mark {
            Some(mark) => self.apply(mark).map(|_| true),
            None => Ok(false),
        }
    }

    /// Removes every item of the collection; returns how many were removed.
    pub fn collection_clear<T: Entity, R: Entity>(
        &mut self,
        owner: EntityRef<T>,
        field: &str,
    ) -> StoreResult<usize> {
        let items = self.load_collection::<T, R>(owner, field)?;
        let mut removed = 0;
        for item in items {
            if self.collection_remove(owner, field, item)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Replaces the single relation with a caller-supplied entity; the
    /// change is picked up by `detect_changes`.
    pub fn assign_reference<T: Entity, R: Entity>(
        &mut self,
        owner: EntityRef<T>,
        field: &str,
        related: Option<EntityRef<R>>,
    ) -> StoreResult<()> {
        self.mapped_binding::<T, R>(field, Cardinality::One)?;
        if let Some(related) = related {
            self.slot(related.id())?;
        }
        self.set_relation(
            owner.id(),
            field,
            RelationSlot::Assigned(Assigned::One(related.map(|related| related.id()))),
        )
    }

    /// Replaces the collection with caller-supplied entities; the
    /// difference to the stored collection is reconciled by
    /// `detect_changes`.
    pub fn assign_collection<T: Entity, R: Entity>(
        &mut self,
        owner: EntityRef<T>,
        field: &str,
        items: impl IntoIterator<Item = EntityRef<R>>,
    ) -> StoreResult<()> {
        self.mapped_binding::<T, R>(field, Cardinality::Many)?;
        let mut ids: Vec<EntityId> = Vec::new();
        for item in items {
            self.slot(item.id())?;
            if !ids.contains(&item.id()) {
                ids.push(item.id());
            }
        }
        self.set_relation(owner.id(), field, RelationSlot::Assigned(Assigned::Many(ids)))
    }

    /// Resolves every mapped relation of `owner` without marking anything.
    pub fn resolve_navigation(&mut self, owner: impl Into<EntityId>) -> StoreResult<()> {
        let owner = owner.into();
        let owner_type = self.slot(owner)?.entity_type();
        let bindings: Vec<Binding> = self
            .registry
            .relationships
            .bindings_for(owner_type)
            .into_iter()
            .cloned()
            .collect();
        for binding in &bindings {
            match binding.cardinality {
                Cardinality::One => {
                    self.resolve_reference(owner, binding)?;
                }
                Cardinality::Many => {
                    self.loaded_items(owner, binding)?;
                }
            }
        }
        Ok(())
    }

    fn typed_binding<T: Entity, R: Entity>(
        &self,
        field: &str,
        cardinality: Cardinality,
    ) -> StoreResult<Option<Binding>> {
        let Some(binding) = self
            .registry
            .relationships
            .binding(EntityType::of::<T>(), field)
        else {
            return Ok(None);
        };
        if binding.cardinality != cardinality {
            return Err(StoreError::RelationMismatch {
                entity: T::NAME,
                field: field.to_string(),
                message: format!(
                    "has cardinality {:?}, expected {cardinality:?}",
                    binding.cardinality
                ),
            });
        }
        if !binding.related.is::<R>() {
            return Err(StoreError::RelationMismatch {
                entity: T::NAME,
                field: field.to_string(),
                message: format!("targets `{}`, not `{}`", binding.related, R::NAME),
            });
        }
        Ok(Some(binding.clone()))
    }

    fn mapped_binding<T: Entity, R: Entity>(
        &self,
        field: &str,
        cardinality: Cardinality,
    ) -> StoreResult<Binding> {
        self.typed_binding::<T, R>(field, cardinality)?
            .ok_or_else(|| StoreError::RelationNotMapped {
                entity: T::NAME,
                field: field.to_string(),
            })
    }

    fn relation(&self, owner: EntityId, field: &str) -> StoreResult<Option<&RelationSlot>> {
        Ok(self.slot(owner)?.relations().get(field))
    }

    fn set_relation(&mut self, owner: EntityId, field: &str, slot: RelationSlot) -> StoreResult<()> {
        self.slot_mut(owner)?
            .relations_mut()
            .insert(field.to_string(), slot);
        Ok(())
    }

    // Related predicate from the owner's original row, or its working copy
    // when it was never stored.
    fn owner_predicate(&self, owner: EntityId, binding: &Binding) -> StoreResult<Predicate> {
        let slot = self.slot(owner)?;
        let row = slot.original_row().unwrap_or_else(|| slot.current_row());
        self.registry.predicate_for(binding, row)
    }

    fn resolve_reference(&mut self, owner: EntityId, binding: &Binding) -> StoreResult<Option<EntityId>> {
        match self.relation(owner, &binding.field)? {
            Some(RelationSlot::Reference(item)) | Some(RelationSlot::Assigned(Assigned::One(item))) => {
                return Ok(*item)
            }
            Some(_) => return Err(cached_as(binding, "a collection")),
            None => {}
        }
        let query = self.owner_predicate(owner, binding)?;
        let first = self.fetch_related(binding.related, &query)?.into_iter().next();
        self.set_relation(owner, &binding.field, RelationSlot::Reference(first))?;
        Ok(first)
    }

    fn ensure_collection(&mut self, owner: EntityId, binding: &Binding) -> StoreResult<()> {
        if self.relation(owner, &binding.field)?.is_some() {
            return Ok(());
        }
        let query = self.owner_predicate(owner, binding)?;
        let owner_type = self.slot(owner)?.entity_type();
        let collection = TrackedCollection::new(
            RelationLink::new(owner, owner_type, binding.field.clone()),
            binding.related,
            query,
        );
        self.set_relation(owner, &binding.field, RelationSlot::Collection(collection))
    }

    fn loaded_items(&mut self, owner: EntityId, binding: &Binding) -> StoreResult<Vec<EntityId>> {
        self.ensure_collection(owner, binding)?;
        let (related, query) = match self.relation(owner, &binding.field)? {
            Some(RelationSlot::Collection(collection)) => match collection.items() {
                Some(items) => return Ok(items.to_vec()),
                None => (collection.related(), collection.query().clone()),
            },
            Some(RelationSlot::Assigned(Assigned::Many(items))) => return Ok(items.clone()),
            _ => return Err(cached_as(binding, "a single reference")),
        };
        let items = self.fetch_related(related, &query)?;
        if let Some(RelationSlot::Collection(collection)) = self
            .slot_mut(owner)?
            .relations_mut()
            .get_mut(&binding.field)
        {
            collection.set_loaded(items.clone());
        }
        Ok(items)
    }

    /// Marks entities implied by assigned relations and by scalar edits.
    pub fn detect_changes(&mut self) -> StoreResult<()> {
        let mut queue: VecDeque<EntityId> = self
            .entries
            .ids_in(&[EntryState::New, EntryState::Modified])
            .into();
        let mut visited = HashSet::new();
        let mut linked = 0;
        while let Some(owner) = queue.pop_front() {
            if !visited.insert(owner) {
                continue;
            }
            let marked = self.reconcile_assigned(owner)?;
            linked += marked.len();
            queue.extend(marked);
        }

        let mut modified = 0;
        for entity in self.identity.entities().to_vec() {
            if self.entries.contains(entity) {
                continue;
            }
            let dirty = self
                .arena
                .get(entity)
                .map_or(false, |slot| !slot.changed_fields().is_empty());
            if dirty {
                self.mark_modified(entity)?;
                modified += 1;
            }
        }
        debug!(
            "event=uow_detect_changes module=tracking status=ok session={} linked={linked} modified={modified}",
            self.session
        );
        Ok(())
    }

    // Turns assigned relation slots of `owner` into marks; returns the
    // entities newly marked `New`.
    fn reconcile_assigned(&mut self, owner: EntityId) -> StoreResult<Vec<EntityId>> {
        let Some(slot) = self.arena.get(owner) else {
            return Ok(Vec::new());
        };
        let owner_type = slot.entity_type();
        let persisted = slot.has_original();
        let assigned: Vec<(String, Assigned)> = slot
            .relations()
            .iter()
            .filter_map(|(field, relation)| match relation {
                RelationSlot::Assigned(assigned) => Some((field.clone(), assigned.clone())),
                _ => None,
            })
            .collect();

        let mut marked = Vec::new();
        for (field, assigned) in assigned {
            let Some(binding) = self.registry.relationships.binding(owner_type, &field).cloned() else {
                continue;
            };
            if !self.registry.contains(binding.related) {
                continue;
            }
            let link = RelationLink::new(owner, owner_type, field.clone());
            match assigned {
                Assigned::One(item) => {
                    if let Some(item) = item {
                        self.mark_with(item, EntryState::New, EntryHooks::link(link))?;
                        marked.push(item);
                    }
                    self.set_relation(owner, &field, RelationSlot::Reference(item))?;
                }
                Assigned::Many(items) => {
                    let query = self.owner_predicate(owner, &binding)?;
                    let previous = if persisted {
                        self.fetch_related(binding.related, &query)?
                    } else {
                        Vec::new()
                    };
                    for gone in previous.iter().filter(|id| !items.contains(id)) {
                        self.mark_with(*gone, EntryState::Deleted, EntryHooks::unlink(link.clone()))?;
                    }
                    for item in items.iter().filter(|id| !previous.contains(id)) {
                        self.mark_with(*item, EntryState::New, EntryHooks::link(link.clone()))?;
                        marked.push(*item);
                    }
                    let mut collection = TrackedCollection::new(link, binding.related, query);
                    collection.set_loaded(items);
                    self.set_relation(owner, &field, RelationSlot::Collection(collection))?;
                }
            }
        }
        Ok(marked)
    }

    /// Detects changes, then persists every pending entry.
    pub fn commit(&mut self) -> StoreResult<CommitReport> {
        info!(
            "event=uow_commit module=tracking status=start session={} entries={}",
            self.session,
            self.entries.len()
        );
        match self.run_commit() {
            Ok(report) => {
                let released = self.arena.len();
                self.entries.clear();
                self.identity.clear();
                self.arena.clear();
                info!(
                    "event=uow_commit module=tracking status=ok session={} created={} updated={} deleted={} skipped={} released={released}",
                    self.session, report.created, report.updated, report.deleted, report.skipped
                );
                Ok(report)
            }
            Err(err) => {
                error!(
                    "event=uow_commit module=tracking status=error session={} error={err}",
                    self.session
                );
                Err(err)
            }
        }
    }

    fn run_commit(&mut self) -> StoreResult<CommitReport> {
        self.detect_changes()?;
        let mut report = CommitReport::default();
        let mut passes = 0;
        while let Some(entity) = self.entries.next_pending() {
            passes += 1;
            if passes > self.options.max_commit_passes {
                return Err(StoreError::CommitPassLimit(self.options.max_commit_passes));
            }
            self.commit_entry(entity, &mut report)?;
        }
        Ok(report)
    }

    fn commit_entry(&mut self, entity: EntityId, report: &mut CommitReport) -> StoreResult<()> {
        let Some(entry) = self.entries.get(entity) else {
            return Ok(());
        };
        let (state, entity_type) = (entry.state(), entry.entity_type());

        if !self.registry.contains(entity_type) {
            return match self.options.unregistered {
                UnregisteredPolicy::Skip => {
                    warn!(
                        "event=uow_entry_commit module=tracking status=skip session={} entity={} id={entity} reason=not_registered",
                        self.session, entity_type
                    );
                    self.entries.complete(entity);
                    report.skipped += 1;
                    Ok(())
                }
                UnregisteredPolicy::Error => Err(StoreError::NotRegistered(entity_type.name())),
            };
        }

        let kind = match state {
            EntryState::New => NotificationKind::Created,
            EntryState::Modified => NotificationKind::Updated,
            _ => NotificationKind::Deleted,
        };
        self.notify(kind, entity, entity_type);

        let hook = self.entries.take_on_commit(entity);
        self.run_hook(hook, entity)?;
        if let Some(current) = self.entries.state(entity).filter(|current| *current != state) {
            let revisits = self.entries.record_revisit(entity);
            debug!(
                "event=uow_entry_commit module=tracking status=requeued session={} entity={} id={entity} from={state:?} to={current:?}",
                self.session, entity_type
            );
            if revisits > self.options.max_entry_revisits {
                return Err(StoreError::NoProgress {
                    entity,
                    state: current,
                    revisits,
                });
            }
            return Ok(());
        }

        let key = self.persist(entity, entity_type, state)?;
        let hook = self.entries.take_on_committed(entity);
        self.entries.complete(entity);
        report.record(entity, entity_type, key, state);
        debug!(
            "event=uow_entry_commit module=tracking status=ok session={} entity={} id={entity} operation={state:?}",
            self.session, entity_type
        );
        self.run_hook(hook, entity)
    }

    // Returns the stored identity once the adapter call succeeded.
    fn persist(
        &mut self,
        entity: EntityId,
        entity_type: EntityType,
        state: EntryState,
    ) -> StoreResult<IdentityKey> {
        let store = self.registry.require(entity_type)?;
        let slot = self
            .arena
            .get_mut(entity)
            .ok_or(StoreError::UnknownEntity(entity))?;
        let failure = adapter_failure(entity_type.name());
        let result = match state {
            EntryState::New => store.create(slot.current_any_mut()),
            EntryState::Modified => store.update(slot.current_row().as_any()),
            EntryState::Deleted => store.delete(slot.current_row().as_any()),
            EntryState::Committed => Ok(()),
        };
        result.map_err(&failure)?;
        store
            .identity_of(slot.current_row().as_any())
            .map_err(&failure)
    }

    fn run_hook(&mut self, hook: CommitHook, entity: EntityId) -> StoreResult<()> {
        match hook {
            CommitHook::None => Ok(()),
            CommitHook::Link(link) => self.link(&link, entity),
            CommitHook::LinkJoin(link) => {
                let binding = self.link_binding(&link)?;
                match &binding.through {
                    Some(through) => self.insert_join_row(&link, through, entity),
                    None => Ok(()),
                }
            }
            CommitHook::Unlink(link) => self.unlink(&link, entity),
            CommitHook::Custom(hook) => hook(self, entity),
        }
    }

    fn link_binding(&self, link: &RelationLink) -> StoreResult<Binding> {
        self.registry
            .relationships
            .binding(link.owner_type, &link.field)
            .cloned()
            .ok_or_else(|| StoreError::RelationNotMapped {
                entity: link.owner_type.name(),
                field: link.field.clone(),
            })
    }

    // Wires `entity` to the owner of `link` before it is persisted.
    fn link(&mut self, link: &RelationLink, entity: EntityId) -> StoreResult<()> {
        let binding = self.link_binding(link)?;
        if let Some(through) = &binding.through {
            if self.slot(entity)?.has_original() {
                self.insert_join_row(link, through, entity)?;
                self.mark_with(entity, EntryState::Modified, EntryHooks::none())?;
            }
            return Ok(());
        }

        let owner = self.slot(link.owner)?;
        let mut values: Vec<(String, Value)> = binding
            .join
            .pairs()
            .iter()
            .map(|pair| (pair.right.clone(), owner.read(&pair.left).unwrap_or(Value::Null)))
            .collect();
        values.extend(constant_assignments(binding.join.extra_filter()));

        let slot = self.slot_mut(entity)?;
        for (field, value) in values {
            slot.write(&field, value);
        }
        if slot.has_original() {
            self.mark_with(entity, EntryState::Modified, EntryHooks::none())?;
        }
        Ok(())
    }

    // Removes the join row of a many-to-many link; the entity survives as
    // `Modified` while other join rows still reference it.
    fn unlink(&mut self, link: &RelationLink, entity: EntityId) -> StoreResult<()> {
        let binding = self.link_binding(link)?;
        let Some(through) = &binding.through else {
            return Ok(());
        };
        let values = self.join_values(link, through, entity)?;
        let related = self.slot(entity)?;
        let remaining = Predicate::all(through.related_keys.pairs().iter().map(|pair| {
            Predicate::eq(
                pair.right.as_str(),
                related.read(&pair.left).unwrap_or(Value::Null),
            )
        }));

        let store = self.registry.require(through.join_entity)?;
        let failure = adapter_failure(through.join_entity.name());
        let removed = store.delete_matching(&values).map_err(&failure)?;
        let still_linked = !store
            .fetch_rows(&remaining, &self.registry)
            .map_err(&failure)?
            .is_empty();
        debug!(
            "event=uow_join module=tracking status=unlinked session={} join={} removed={removed} still_linked={still_linked}",
            self.session, through.join_entity
        );
        if still_linked {
            self.mark_with(entity, EntryState::Modified, EntryHooks::none())?;
        }
        Ok(())
    }

    fn insert_join_row(&mut self, link: &RelationLink, through: &Through, entity: EntityId) -> StoreResult<()> {
        let values = self.join_values(link, through, entity)?;
        let store = self.registry.require(through.join_entity)?;
        store
            .create_from_values(&values)
            .map_err(adapter_failure(through.join_entity.name()))?;
        debug!(
            "event=uow_join module=tracking status=linked session={} join={}",
            self.session, through.join_entity
        );
        Ok(())
    }

    fn join_values(
        &self,
        link: &RelationLink,
        through: &Through,
        entity: EntityId,
    ) -> StoreResult<Vec<(String, Value)>> {
        let owner = self.slot(link.owner)?;
        let related = self.slot(entity)?;
        let mut values: Vec<(String, Value)> = through
            .owner_keys
            .pairs()
            .iter()
            .map(|pair| (pair.right.clone(), owner.read(&pair.left).unwrap_or(Value::Null)))
            .chain(through.related_keys.pairs().iter().map(|pair| {
                (pair.right.clone(), related.read(&pair.left).unwrap_or(Value::Null))
            }))
            .collect();
        values.extend(constant_assignments(through.owner_keys.extra_filter()));
        Ok(values)
    }

    fn notify(&mut self, kind: NotificationKind, id: EntityId, entity_type: EntityType) {
        let notification = Notification {
            kind,
            entity: EntityHandle { id, entity_type },
        };
        for observer in &mut self.observers {
            observer(&notification);
        }
    }

    /// Runs a non-query command immediately, outside the entry table.
    ///
    /// Pending entries are neither flushed nor reloaded; tracked copies of
    /// rows the command touched keep their old values.
    pub fn execute_command(&mut self, command: &Command) -> StoreResult<usize> {
        let Some(commands) = &self.commands else {
            warn!(
                "event=uow_execute module=tracking status=error session={} reason=no_command_target",
                self.session
            );
            return Err(StoreError::NoCommandTarget);
        };
        match commands.execute_non_query(command) {
            Ok(affected) => {
                info!(
                    "event=uow_execute module=tracking status=ok session={} parameters={} affected={affected} pending={}",
                    self.session,
                    command.parameters().len(),
                    self.entries.len()
                );
                Ok(affected)
            }
            Err(err) => {
                error!(
                    "event=uow_execute module=tracking status=error session={} error={err}",
                    self.session
                );
                Err(StoreError::Command(err))
            }
        }
    }

    /// Drops every tracked entity, entry and identity. Handles issued
    /// earlier no longer resolve.
    pub fn dispose(&mut self) {
        self.entries.clear();
        self.identity.clear();
        self.arena.clear();
        info!(
            "event=uow_dispose module=tracking status=ok session={}",
            self.session
        );
    }
}

fn adapter_failure(entity: &'static str) -> impl Fn(AdapterError) -> StoreError {
    move |source| StoreError::Adapter { entity, source }
}

fn cached_as(binding: &Binding, shape: &str) -> StoreError {
    StoreError::RelationMismatch {
        entity: binding.owner.name(),
        field: binding.field.clone(),
        message: format!("is cached as {shape}"),
    }
}

// Field assignments implied by top-level equality constraints of a join
// filter.
fn constant_assignments(filter: Option<&Predicate>) -> Vec<(String, Value)> {
    match filter {
        Some(Predicate::Compare(Comparison {
            field,
            op: CompareOp::Eq,
            value,
        })) => vec![(field.clone(), value.clone())],
        Some(Predicate::And(parts)) => parts
            .iter()
            .flat_map(|part| constant_assignments(Some(part)))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::UnitOfWork;
    use crate::adapter::{Command, InMemoryAdapter, OperationKind};
    use crate::config::{UnitOfWorkOptions, UnregisteredPolicy};
    use crate::error::{StoreError, StoreResult};
    use crate::query::Predicate;
    use crate::tracking::{EntityId, EntryHooks, EntryState, NotificationKind};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Task {
        id: i64,
        title: String,
        done: bool,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Draft {
        id: i64,
    }

    crate::entity_fields!(Task as "task" => [id, title, done]);
    crate::entity_fields!(Draft as "draft" => [id]);

    fn task(id: i64, title: &str) -> Task {
        Task {
            id,
            title: title.to_string(),
            done: false,
        }
    }

    fn seeded() -> (UnitOfWork, Rc<InMemoryAdapter<Task>>) {
        let adapter = Rc::new(
            InMemoryAdapter::new(&["id"]).with_rows([task(1, "write"), task(2, "review")]),
        );
        let mut uow = UnitOfWork::new();
        uow.register::<Task>(adapter.clone());
        (uow, adapter)
    }

    #[test]
    fn loading_twice_yields_the_same_proxy() {
        let (mut uow, _) = seeded();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        uow.subscribe(move |notification| sink.borrow_mut().push(notification.kind));

        let first = uow
            .find::<Task>(Predicate::eq("id", 1))
            .load(&mut uow)
            .expect("first load");
        let second = uow
            .find::<Task>(Predicate::True)
            .load(&mut uow)
            .expect("second load");

        assert_eq!(first[0], second[0]);
        assert_eq!(uow.materialized_count(), 2);
        assert_eq!(
            *seen.borrow(),
            vec![NotificationKind::Materialized, NotificationKind::Materialized]
        );
    }

    #[test]
    fn only_edited_entities_become_modified() {
        let (mut uow, _) = seeded();
        let tasks = uow.find::<Task>(Predicate::True).load(&mut uow).expect("load");

        uow.detect_changes().expect("detect without edits");
        assert_eq!(uow.pending_count(), 0);

        uow.get_mut(tasks[1]).expect("tracked task").done = true;
        uow.detect_changes().expect("detect edits");
        assert_eq!(uow.state_of(tasks[0]), None);
        assert_eq!(uow.state_of(tasks[1]), Some(EntryState::Modified));
        assert_eq!(uow.original(tasks[1]).map(|task| task.done), Some(false));
    }

    #[test]
    fn committed_is_not_a_mark() {
        let (mut uow, _) = seeded();
        let draft = uow.attach(task(9, "new")).expect("attach");
        assert!(matches!(
            uow.mark_with(draft, EntryState::Committed, EntryHooks::none()),
            Err(StoreError::InvalidMark(EntryState::Committed))
        ));
    }

    #[test]
    fn commit_clears_identities() {
        let (mut uow, adapter) = seeded();
        let before = uow.find_single::<Task>(Predicate::eq("id", 2)).expect("find").expect("task 2");
        uow.get_mut(before).expect("tracked").title = "ship".to_string();

        let report = uow.commit().expect("commit");
        assert_eq!(report.updated, 1);
        assert_eq!(uow.pending_count(), 0);
        assert_eq!(uow.materialized_count(), 0);
        assert_eq!(adapter.operations(OperationKind::Update)[0].title, "ship");
        assert_eq!(uow.tracked_count(), 0);
        assert!(uow.get(before).is_none());

        let after = uow.find_single::<Task>(Predicate::eq("id", 2)).expect("find").expect("task 2");
        assert_ne!(before, after);
        assert_eq!(before.id().index(), after.id().index());
        assert_eq!(uow.get(after).map(|task| task.title.as_str()), Some("ship"));
    }

    fn flip(uow: &mut UnitOfWork, entity: EntityId) -> StoreResult<()> {
        let next = match uow.state_of(entity) {
            Some(EntryState::New) => EntryState::Modified,
            _ => EntryState::New,
        };
        uow.mark_with(entity, next, EntryHooks::before_commit(flip))
    }

    #[test]
    fn toggling_hooks_hit_the_revisit_guard() {
        let (mut uow, adapter) = seeded();
        let fresh = uow.attach(task(3, "loop")).expect("attach");
        uow.mark_with(fresh, EntryState::New, EntryHooks::before_commit(flip))
            .expect("mark");

        match uow.commit() {
            Err(StoreError::NoProgress { revisits, .. }) => assert_eq!(revisits, 17),
            other => panic!("expected NoProgress, got {other:?}"),
        }
        assert!(adapter.journal().is_empty());
        assert_eq!(uow.pending_count(), 1);
    }

    #[test]
    fn unregistered_entries_follow_the_policy() {
        let mut skipping = UnitOfWork::new();
        skipping.add(Draft { id: 1 }).expect("add draft");
        let report = skipping.commit().expect("skip commit");
        assert_eq!(report.skipped, 1);
        assert!(report.committed.is_empty());

        let mut strict = UnitOfWork::with_options(UnitOfWorkOptions {
            unregistered: UnregisteredPolicy::Error,
            ..UnitOfWorkOptions::default()
        });
        strict.add(Draft { id: 1 }).expect("add draft");
        assert!(matches!(
            strict.commit(),
            Err(StoreError::NotRegistered("draft"))
        ));
    }

    #[test]
    fn commands_need_a_target_and_leave_entries_alone() {
        let (mut uow, _) = seeded();
        let archive = Command::new("archive");
        assert!(matches!(
            uow.execute_command(&archive),
            Err(StoreError::NoCommandTarget)
        ));

        let adapter = Rc::new(
            InMemoryAdapter::new(&["id"])
                .with_rows([task(1, "write"), task(2, "review")])
                .with_mutation("archive", |rows: &mut Vec<Task>, _params| {
                    rows.iter_mut().for_each(|row| row.done = true);
                    rows.len()
                }),
        );
        let mut uow = UnitOfWork::new().with_command_target(adapter.clone());
        uow.register::<Task>(adapter.clone());
        let pending = uow.add(task(3, "ship")).expect("add task");

        assert_eq!(uow.execute_command(&archive).expect("archive"), 2);
        assert!(adapter.rows().iter().all(|row| row.done));
        assert_eq!(uow.state_of(pending), Some(EntryState::New));
        assert!(adapter.journal().is_empty());

        assert!(matches!(
            uow.execute_command(&Command::new("purge")),
            Err(StoreError::Command(_))
        ));
    }
}
