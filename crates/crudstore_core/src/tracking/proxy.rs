//! Lazy proxies: tracked entities with an original snapshot, a working copy
//! and a per-relation cache.
//!
//! # Responsibility
//! - Build and cache one validated `EntityModel` per entity type.
//! - Keep the materialized original next to the caller-visible working copy
//!   so scalar changes can be detected without storage access.
//! - Hold relation slots that are filled on first access.
//!
//! # Invariants
//! - A model is built at most once per type per cache; concurrent requests
//!   observe the same `Arc`.
//! - A proxy's original never changes after materialization.
//! - Relation slots are absent until first read or assignment.

use crate::model::{Entity, EntityType, Row, Value};
use crate::tracking::collection::RelationSlot;
use log::{debug, info};
use once_cell::sync::Lazy;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};

static GLOBAL_MODELS: Lazy<Arc<ModelCache>> = Lazy::new(|| Arc::new(ModelCache::new()));

/// Relation slots of one proxy, keyed by relation field.
pub(crate) type RelationCache = BTreeMap<String, RelationSlot>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    EmptyManifest(&'static str),
    BlankField(&'static str),
    DuplicateField {
        entity: &'static str,
        field: &'static str,
    },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyManifest(entity) => write!(f, "entity `{entity}` declares no fields"),
            Self::BlankField(entity) => write!(f, "entity `{entity}` declares a blank field name"),
            Self::DuplicateField { entity, field } => {
                write!(f, "entity `{entity}` declares field `{field}` twice")
            }
        }
    }
}

impl Error for ModelError {}

/// Validated description of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityModel {
    entity: EntityType,
    fields: Vec<&'static str>,
}

impl EntityModel {
    fn build<E: Entity>() -> Result<Self, ModelError> {
        let manifest = E::fields();
        if manifest.is_empty() {
            return Err(ModelError::EmptyManifest(E::NAME));
        }
        let mut seen = HashSet::new();
        for field in manifest {
            if field.name.trim().is_empty() {
                return Err(ModelError::BlankField(E::NAME));
            }
            if !seen.insert(field.name) {
                return Err(ModelError::DuplicateField {
                    entity: E::NAME,
                    field: field.name,
                });
            }
        }
        Ok(Self {
            entity: EntityType::of::<E>(),
            fields: manifest.iter().map(|field| field.name).collect(),
        })
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }
}

/// Per-type model cache, shared across units of work.
#[derive(Debug, Default)]
pub struct ModelCache {
    models: Mutex<HashMap<TypeId, Arc<EntityModel>>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache used by `UnitOfWork::new`.
    pub fn global() -> Arc<ModelCache> {
        Arc::clone(&GLOBAL_MODELS)
    }

    /// Returns the cached model for `E`, building it on first request.
    pub fn model_for<E: Entity>(&self) -> Result<Arc<EntityModel>, ModelError> {
        let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = models.get(&TypeId::of::<E>()) {
            return Ok(Arc::clone(model));
        }
        let model = Arc::new(EntityModel::build::<E>()?);
        info!(
            "event=model_build module=tracking status=ok entity={} fields={}",
            E::NAME,
            model.fields.len()
        );
        models.insert(TypeId::of::<E>(), Arc::clone(&model));
        Ok(model)
    }

    pub fn len(&self) -> usize {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tracked wrapper around one entity of type `T`.
#[derive(Debug)]
pub struct LazyEntity<T: Entity> {
    model: Arc<EntityModel>,
    original: Option<T>,
    current: T,
    relations: RelationCache,
}

impl<T: Entity> LazyEntity<T> {
    /// Proxy over a row read from storage.
    pub(crate) fn materialized(model: Arc<EntityModel>, row: T) -> Self {
        Self {
            model,
            current: row.clone(),
            original: Some(row),
            relations: RelationCache::new(),
        }
    }

    /// Proxy over a caller-created entity with no stored counterpart.
    pub(crate) fn detached(model: Arc<EntityModel>, entity: T) -> Self {
        Self {
            model,
            original: None,
            current: entity,
            relations: RelationCache::new(),
        }
    }

    pub fn model(&self) -> &EntityModel {
        &self.model
    }

    pub fn original(&self) -> Option<&T> {
        self.original.as_ref()
    }

    pub fn current(&self) -> &T {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut T {
        &mut self.current
    }
}

/// Type-erased access used by the unit of work.
pub(crate) trait TrackedEntity {
    fn entity_type(&self) -> EntityType;
    fn has_original(&self) -> bool;
    fn original_row(&self) -> Option<&dyn Row>;
    fn current_row(&self) -> &dyn Row;
    fn current_any_mut(&mut self) -> &mut dyn Any;
    fn read(&self, field: &str) -> Option<Value>;
    fn write(&mut self, field: &str, value: Value) -> bool;
    /// Scalar fields whose working value differs from the original.
    fn changed_fields(&self) -> Vec<&'static str>;
    fn relations(&self) -> &RelationCache;
    fn relations_mut(&mut self) -> &mut RelationCache;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Entity> TrackedEntity for LazyEntity<T> {
    fn entity_type(&self) -> EntityType {
        self.model.entity
    }

    fn has_original(&self) -> bool {
        self.original.is_some()
    }

    fn original_row(&self) -> Option<&dyn Row> {
        self.original.as_ref().map(|original| original as &dyn Row)
    }

    fn current_row(&self) -> &dyn Row {
        &self.current
    }

    fn current_any_mut(&mut self) -> &mut dyn Any {
        &mut self.current
    }

    fn read(&self, field: &str) -> Option<Value> {
        self.current.value(field)
    }

    fn write(&mut self, field: &str, value: Value) -> bool {
        let written = crate::model::set_field(&mut self.current, field, value);
        if !written {
            debug!(
                "event=field_write module=tracking status=rejected entity={} field={field}",
                T::NAME
            );
        }
        written
    }

    fn changed_fields(&self) -> Vec<&'static str> {
        let Some(original) = &self.original else {
            return Vec::new();
        };
        T::fields()
            .iter()
            .filter(|field| !(field.get)(original).same_as(&(field.get)(&self.current)))
            .map(|field| field.name)
            .collect()
    }

    fn relations(&self) -> &RelationCache {
        &self.relations
    }

    fn relations_mut(&mut self) -> &mut RelationCache {
        &mut self.relations
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
