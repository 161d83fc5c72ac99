//! Adapter registry and relation resolution.
//!
//! # Responsibility
//! - Keep one `DataStore` per registered entity type behind a type-erased
//!   interface so commit can drive adapters for any tracked type.
//! - Build related-entity predicates from bindings and owner rows.
//! - Resolve relation fields on raw rows for navigation predicates.
//!
//! # Invariants
//! - The first adapter registered for a type wins.
//! - Relation predicates are built from the row passed in; callers pass the
//!   owner's original row when one exists.

use crate::adapter::{AdapterError, AdapterResult, CrudAdapter};
use crate::error::{StoreError, StoreResult};
use crate::mapping::{Binding, Join, RelationshipMap};
use crate::model::{set_field, Entity, EntityType, IdentityKey, Row, Value};
use crate::query::{Navigation, Predicate, Specification};
use crate::tracking::proxy::{LazyEntity, ModelCache, TrackedEntity};
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

/// Registered adapter for entities of type `T`.
pub struct DataStore<T: Entity> {
    adapter: Rc<dyn CrudAdapter<T>>,
}

impl<T: Entity> DataStore<T> {
    pub fn new(adapter: Rc<dyn CrudAdapter<T>>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &dyn CrudAdapter<T> {
        self.adapter.as_ref()
    }

    pub fn identity(&self, entity: &T) -> IdentityKey {
        self.adapter.read().identity(entity)
    }

    pub fn fetch(
        &self,
        specification: &Specification<T>,
        navigation: &dyn Navigation,
    ) -> AdapterResult<Vec<T>> {
        specification.satisfying_entities_from(self.adapter.read(), navigation)
    }

    fn downcast<'a>(entity: &'a dyn Any) -> AdapterResult<&'a T> {
        entity
            .downcast_ref::<T>()
            .ok_or(AdapterError::TypeMismatch { expected: T::NAME })
    }

    fn entity_from_values(values: &[(String, Value)]) -> AdapterResult<T> {
        let mut entity = T::default();
        for (field, value) in values {
            if !set_field(&mut entity, field, value.clone()) {
                return Err(AdapterError::InvalidData(format!(
                    "cannot assign {value} to `{}.{field}`",
                    T::NAME
                )));
            }
        }
        Ok(entity)
    }
}

/// Type-erased store operations used by the unit of work.
pub(crate) trait ErasedStore {
    fn as_any(&self) -> &dyn Any;
    fn fetch_rows(
        &self,
        predicate: &Predicate,
        navigation: &dyn Navigation,
    ) -> AdapterResult<Vec<Box<dyn Row>>>;
    fn fetch_tracked(
        &self,
        predicate: &Predicate,
        navigation: &dyn Navigation,
        models: &ModelCache,
    ) -> StoreResult<Vec<(IdentityKey, Box<dyn TrackedEntity>)>>;
    fn create(&self, entity: &mut dyn Any) -> AdapterResult<()>;
    fn update(&self, entity: &dyn Any) -> AdapterResult<()>;
    fn delete(&self, entity: &dyn Any) -> AdapterResult<()>;
    fn identity_of(&self, entity: &dyn Any) -> AdapterResult<IdentityKey>;
    fn create_from_values(&self, values: &[(String, Value)]) -> AdapterResult<()>;
    /// Deletes every stored row whose fields equal `values`; returns how
    /// many rows were removed.
    fn delete_matching(&self, values: &[(String, Value)]) -> AdapterResult<usize>;
}

impl<T: Entity> ErasedStore for DataStore<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fetch_rows(
        &self,
        predicate: &Predicate,
        navigation: &dyn Navigation,
    ) -> AdapterResult<Vec<Box<dyn Row>>> {
        let rows = self.adapter.read().execute_predicate(predicate, navigation)?;
        Ok(rows
            .into_iter()
            .map(|row| Box::new(row) as Box<dyn Row>)
            .collect())
    }

    fn fetch_tracked(
        &self,
        predicate: &Predicate,
        navigation: &dyn Navigation,
        models: &ModelCache,
    ) -> StoreResult<Vec<(IdentityKey, Box<dyn TrackedEntity>)>> {
        let model = models.model_for::<T>()?;
        let rows = self
            .adapter
            .read()
            .execute_predicate(predicate, navigation)
            .map_err(|source| StoreError::Adapter {
                entity: T::NAME,
                source,
            })?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let key = self.identity(&row);
                let slot: Box<dyn TrackedEntity> =
                    Box::new(LazyEntity::materialized(model.clone(), row));
                (key, slot)
            })
            .collect())
    }

    fn create(&self, entity: &mut dyn Any) -> AdapterResult<()> {
        let entity = entity
            .downcast_mut::<T>()
            .ok_or(AdapterError::TypeMismatch { expected: T::NAME })?;
        self.adapter.create(entity)
    }

    fn update(&self, entity: &dyn Any) -> AdapterResult<()> {
        self.adapter.update(Self::downcast(entity)?)
    }

    fn delete(&self, entity: &dyn Any) -> AdapterResult<()> {
        self.adapter.delete(Self::downcast(entity)?)
    }

    fn identity_of(&self, entity: &dyn Any) -> AdapterResult<IdentityKey> {
        Ok(self.identity(Self::downcast(entity)?))
    }

    fn create_from_values(&self, values: &[(String, Value)]) -> AdapterResult<()> {
        let mut entity = Self::entity_from_values(values)?;
        self.adapter.create(&mut entity)
    }

    fn delete_matching(&self, values: &[(String, Value)]) -> AdapterResult<usize> {
        let predicate = Predicate::all(
            values
                .iter()
                .map(|(field, value)| Predicate::eq(field.as_str(), value.clone())),
        );
        let rows = self
            .adapter
            .read()
            .execute_predicate(&predicate, &crate::query::NoNavigation)?;
        for row in &rows {
            self.adapter.delete(row)?;
        }
        Ok(rows.len())
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    stores: HashMap<EntityType, Box<dyn ErasedStore>>,
    pub(crate) relationships: RelationshipMap,
}

impl Registry {
    /// Returns `false` when `T` already had an adapter.
    pub(crate) fn register<T: Entity>(&mut self, adapter: Rc<dyn CrudAdapter<T>>) -> bool {
        let entity_type = EntityType::of::<T>();
        if self.stores.contains_key(&entity_type) {
            return false;
        }
        self.stores
            .insert(entity_type, Box::new(DataStore::new(adapter)));
        true
    }

    pub(crate) fn contains(&self, entity_type: EntityType) -> bool {
        self.stores.contains_key(&entity_type)
    }

    pub(crate) fn erased(&self, entity_type: EntityType) -> Option<&dyn ErasedStore> {
        self.stores.get(&entity_type).map(|store| &**store)
    }

    pub(crate) fn require(&self, entity_type: EntityType) -> StoreResult<&dyn ErasedStore> {
        self.erased(entity_type)
            .ok_or(StoreError::NotRegistered(entity_type.name()))
    }

    pub(crate) fn store<T: Entity>(&self) -> StoreResult<&DataStore<T>> {
        self.erased(EntityType::of::<T>())
            .and_then(|store| store.as_any().downcast_ref::<DataStore<T>>())
            .ok_or(StoreError::NotRegistered(T::NAME))
    }

    /// Predicate over `binding.related` selecting what `owner` relates to.
    pub(crate) fn predicate_for(&self, binding: &Binding, owner: &dyn Row) -> StoreResult<Predicate> {
        let Some(through) = &binding.through else {
            let keys = key_equalities(&binding.join, owner);
            return Ok(match binding.join.extra_filter() {
                Some(filter) => keys.and(filter.clone()),
                None => keys,
            });
        };

        let mut join_predicate = key_equalities(&through.owner_keys, owner);
        if let Some(filter) = through.owner_keys.extra_filter() {
            join_predicate = join_predicate.and(filter.clone());
        }
        let join_rows = match self.erased(through.join_entity) {
            Some(store) => store
                .fetch_rows(&join_predicate, self)
                .map_err(|source| StoreError::Adapter {
                    entity: through.join_entity.name(),
                    source,
                })?,
            None => return Err(StoreError::NotRegistered(through.join_entity.name())),
        };

        let per_row = join_rows.iter().map(|join_row| {
            Predicate::all(through.related_keys.pairs().iter().map(|pair| {
                Predicate::eq(
                    pair.left.as_str(),
                    join_row.value(&pair.right).unwrap_or(Value::Null),
                )
            }))
        });
        let mut related = Predicate::any(per_row);
        if let Some(filter) = through.related_keys.extra_filter() {
            related = related.and(filter.clone());
        }
        Ok(related)
    }
}

// `right == owner.left` for every pair of `join`.
fn key_equalities(join: &Join, owner: &dyn Row) -> Predicate {
    Predicate::all(join.pairs().iter().map(|pair| {
        Predicate::eq(
            pair.right.as_str(),
            owner.value(&pair.left).unwrap_or(Value::Null),
        )
    }))
}

impl Navigation for Registry {
    fn navigate(&self, owner: &dyn Row, field: &str) -> AdapterResult<Option<Vec<Box<dyn Row>>>> {
        let Some(binding) = self.relationships.binding(owner.entity_type(), field) else {
            return Ok(None);
        };
        let Some(store) = self.erased(binding.related) else {
            return Ok(None);
        };
        let predicate = self.predicate_for(binding, owner)?;
        store.fetch_rows(&predicate, self).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use crate::adapter::InMemoryAdapter;
    use crate::mapping::{Join, PropertyMap};
    use crate::model::Row;
    use crate::query::{rewrite, Navigation, Predicate};
    use std::rc::Rc;

    #[derive(Debug, Clone, Default)]
    struct Author {
        id: i64,
        name: String,
    }

    #[derive(Debug, Clone, Default)]
    struct Book {
        id: i64,
        author_id: i64,
        title: String,
    }

    #[derive(Debug, Clone, Default)]
    struct Shelf {
        id: i64,
    }

    #[derive(Debug, Clone, Default)]
    struct ShelfBook {
        shelf_id: i64,
        book_id: i64,
    }

    crate::entity_fields!(Author as "author" => [id, name]);
    crate::entity_fields!(Book as "book" => [id, author_id, title]);
    crate::entity_fields!(Shelf as "shelf" => [id]);
    crate::entity_fields!(ShelfBook as "shelf_book" => [shelf_id, book_id]);

    fn book(id: i64, author_id: i64, title: &str) -> Book {
        Book {
            id,
            author_id,
            title: title.to_string(),
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::default();
        registry.register::<Author>(Rc::new(InMemoryAdapter::new(&["id"])));
        registry.register::<Book>(Rc::new(InMemoryAdapter::new(&["id"]).with_rows([
            book(1, 1, "Dune"),
            book(2, 1, "Children of Dune"),
            book(3, 2, "Neuromancer"),
        ])));
        registry.register::<Shelf>(Rc::new(InMemoryAdapter::new(&["id"])));
        registry.register::<ShelfBook>(Rc::new(
            InMemoryAdapter::new(&["shelf_id", "book_id"]).with_rows([
                ShelfBook {
                    shelf_id: 10,
                    book_id: 1,
                },
                ShelfBook {
                    shelf_id: 10,
                    book_id: 3,
                },
            ]),
        ));
        PropertyMap::<Author>::new(&mut registry.relationships)
            .map_many::<Book>("books", Join::on("id", "author_id"));
        PropertyMap::<Shelf>::new(&mut registry.relationships).map_through::<Book, ShelfBook>(
            "books",
            Join::on("id", "shelf_id"),
            Join::on("id", "book_id"),
        );
        registry
    }

    fn titles(rows: Option<Vec<Box<dyn Row>>>) -> Vec<String> {
        rows.expect("relation is mapped")
            .iter()
            .filter_map(|row| row.value("title").and_then(|v| v.as_text().map(str::to_string)))
            .collect()
    }

    #[test]
    fn direct_bindings_filter_by_owner_keys() {
        let registry = registry();
        let author = Author {
            id: 1,
            name: "Herbert".to_string(),
        };
        let books = registry.navigate(&author, "books").expect("navigate books");
        assert_eq!(titles(books), vec!["Dune", "Children of Dune"]);
        assert!(registry
            .navigate(&author, "awards")
            .expect("navigate unmapped")
            .is_none());
    }

    #[test]
    fn through_bindings_go_via_join_rows() {
        let registry = registry();
        let shelf = Shelf { id: 10 };
        let books = registry.navigate(&shelf, "books").expect("navigate shelf");
        assert_eq!(titles(books), vec!["Dune", "Neuromancer"]);

        let empty = Shelf { id: 11 };
        assert!(titles(registry.navigate(&empty, "books").expect("navigate empty")).is_empty());
    }

    #[test]
    fn navigation_predicates_match_through_the_registry() {
        let registry = registry();
        let predicate = Predicate::related("books", Predicate::starts_with("title", "Neuro"));
        let bound = rewrite(&predicate, &registry);
        let gibson = Author {
            id: 2,
            name: "Gibson".to_string(),
        };
        let herbert = Author {
            id: 1,
            name: "Herbert".to_string(),
        };
        assert!(bound.matches(&gibson).expect("evaluate gibson"));
        assert!(!bound.matches(&herbert).expect("evaluate herbert"));
    }

    #[test]
    fn first_registration_wins() {
        let mut registry = registry();
        assert!(!registry.register::<Book>(Rc::new(InMemoryAdapter::new(&["id"]))));
        let store = registry.store::<Book>().expect("book store");
        assert_eq!(
            store
                .fetch(&Predicate::True.into(), &crate::query::NoNavigation)
                .expect("fetch books")
                .len(),
            3
        );
    }
}
