//! Entity contract and field manifests.
//!
//! # Responsibility
//! - Describe user entity types through a static field manifest.
//! - Expose untyped row access for predicates, adapters and identity keys.
//!
//! # Invariants
//! - `Entity::fields()` lists scalar fields only; relations are mapped
//!   separately on the unit of work.
//! - Field accessors are plain function pointers and never capture state.

use crate::model::value::Value;
use std::any::{Any, TypeId};
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

/// Accessor pair for one scalar field of `E`.
pub struct Field<E> {
    pub name: &'static str,
    pub get: fn(&E) -> Value,
    /// Returns `false` when the value cannot be stored in the field.
    pub set: fn(&mut E, Value) -> bool,
}

impl<E> Debug for Field<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field").field("name", &self.name).finish()
    }
}

/// A user type that can be stored, queried and tracked.
///
/// Implementations usually come from [`crate::entity_fields!`].
pub trait Entity: Any + Clone + Default + Debug {
    /// Stable entity name used in logs and errors.
    const NAME: &'static str;

    fn fields() -> &'static [Field<Self>];
}

/// Runtime identity of an entity type.
#[derive(Clone, Copy)]
pub struct EntityType {
    id: TypeId,
    name: &'static str,
}

impl EntityType {
    pub fn of<E: Entity>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: E::NAME,
        }
    }

    pub fn name(self) -> &'static str {
        self.name
    }

    pub fn type_id(self) -> TypeId {
        self.id
    }

    pub fn is<E: Entity>(self) -> bool {
        self.id == TypeId::of::<E>()
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EntityType {}

impl Hash for EntityType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntityType({})", self.name)
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Untyped, read-only view over one entity instance.
pub trait Row {
    fn entity_type(&self) -> EntityType;

    /// Returns `None` when the entity has no scalar field called `field`.
    fn value(&self, field: &str) -> Option<Value>;

    fn as_any(&self) -> &dyn Any;
}

impl<E: Entity> Row for E {
    fn entity_type(&self) -> EntityType {
        EntityType::of::<E>()
    }

    fn value(&self, name: &str) -> Option<Value> {
        field::<E>(name).map(|field| (field.get)(self))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Looks up a field accessor by name.
pub fn field<E: Entity>(name: &str) -> Option<&'static Field<E>> {
    E::fields().iter().find(|field| field.name == name)
}

/// Writes `value` into `entity.<name>`.
///
/// Returns `false` for unknown fields or incompatible values.
pub fn set_field<E: Entity>(entity: &mut E, name: &str, value: Value) -> bool {
    match field::<E>(name) {
        Some(field) => (field.set)(entity, value),
        None => false,
    }
}

/// Implements [`Entity`] for a struct from a list of its scalar fields.
///
/// ```ignore
/// entity_fields!(Person as "person" => [id, name, age]);
/// ```
///
/// Every listed field type must implement `Into<Value>` (by clone) and
/// [`crate::model::FromValue`].
#[macro_export]
macro_rules! entity_fields {
    ($entity:ty as $name:literal => [$($field:ident),* $(,)?]) => {
        impl $crate::model::Entity for $entity {
            const NAME: &'static str = $name;

            fn fields() -> &'static [$crate::model::Field<Self>] {
                static FIELDS: &[$crate::model::Field<$entity>] = &[
                    $(
                        $crate::model::Field {
                            name: stringify!($field),
                            get: |entity: &$entity| $crate::model::Value::from(entity.$field.clone()),
                            set: |entity: &mut $entity, value: $crate::model::Value| {
                                match $crate::model::FromValue::from_value(value) {
                                    Some(parsed) => {
                                        entity.$field = parsed;
                                        true
                                    }
                                    None => false,
                                }
                            },
                        },
                    )*
                ];
                FIELDS
            }
        }
    };
}
