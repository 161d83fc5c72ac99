//! Deferred queries over tracked entities.
//!
//! # Responsibility
//! - Collect a specification plus refinement steps without touching
//!   storage.
//! - Execute on demand: the adapter runs the specification, results are
//!   materialized through the unit of work, then refinements apply to the
//!   tracked working copies.
//!
//! # Invariants
//! - Building a `Query` performs no I/O; only terminal operations do.
//! - Refinements run in the order they were added.
//! - `then_by` extends the most recent `order_by`, even when paging or
//!   filtering steps sit between them.

use crate::adapter::{AdapterResult, QueryAdapter};
use crate::error::{StoreError, StoreResult};
use crate::model::{Entity, Row, Value};
use crate::query::navigation::{rewrite, Navigation};
use crate::query::predicate::Predicate;
use crate::query::specification::Specification;
use crate::tracking::{EntityRef, UnitOfWork};
use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Filter(Predicate),
    Order {
        field: String,
        direction: Direction,
        then: bool,
    },
    Skip(usize),
    Take(usize),
}

/// Deferred query for entities of type `T`.
pub struct Query<T> {
    specification: Specification<T>,
    steps: Vec<Step>,
}

impl<T: Entity> Query<T> {
    pub fn new(specification: Specification<T>) -> Self {
        Self {
            specification,
            steps: Vec::new(),
        }
    }

    pub fn specification(&self) -> &Specification<T> {
        &self.specification
    }

    /// Further restricts results; may reference relation fields.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.steps.push(Step::Filter(predicate));
        self
    }

    pub fn order_by(self, field: impl Into<String>) -> Self {
        self.order(field.into(), Direction::Ascending, false)
    }

    pub fn order_by_desc(self, field: impl Into<String>) -> Self {
        self.order(field.into(), Direction::Descending, false)
    }

    pub fn then_by(self, field: impl Into<String>) -> Self {
        self.order(field.into(), Direction::Ascending, true)
    }

    pub fn then_by_desc(self, field: impl Into<String>) -> Self {
        self.order(field.into(), Direction::Descending, true)
    }

    fn order(mut self, field: String, direction: Direction, then: bool) -> Self {
        self.steps.push(Step::Order {
            field,
            direction,
            then,
        });
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.steps.push(Step::Skip(count));
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.steps.push(Step::Take(count));
        self
    }

    /// Executes the query and returns tracked entities.
    pub fn load(&self, uow: &mut UnitOfWork) -> StoreResult<Vec<EntityRef<T>>> {
        uow.execute(self)
    }

    pub fn first(&self, uow: &mut UnitOfWork) -> StoreResult<Option<EntityRef<T>>> {
        let limited = self.clone().take(1);
        Ok(uow.execute(&limited)?.into_iter().next())
    }

    pub fn count(&self, uow: &mut UnitOfWork) -> StoreResult<usize> {
        Ok(uow.execute(self)?.len())
    }

    pub fn any(&self, uow: &mut UnitOfWork) -> StoreResult<bool> {
        Ok(self.first(uow)?.is_some())
    }

    /// Projects every result through `project`.
    pub fn select<U>(&self, uow: &mut UnitOfWork, project: impl Fn(&T) -> U) -> StoreResult<Vec<U>> {
        let refs = uow.execute(self)?;
        Ok(refs
            .iter()
            .filter_map(|entity| uow.get(*entity).map(&project))
            .collect())
    }

    /// Executes against `adapter` directly, returning untracked values.
    pub fn fetch(
        &self,
        adapter: &dyn QueryAdapter<T>,
        navigation: &dyn Navigation,
    ) -> StoreResult<Vec<T>> {
        let to_store_error = |source| StoreError::Adapter {
            entity: T::NAME,
            source,
        };
        let rows = self
            .specification
            .satisfying_entities_from(adapter, navigation)
            .map_err(to_store_error)?;
        self.refine(rows, |row| row as &dyn Row, navigation)
            .map_err(to_store_error)
    }

    /// Applies filter, ordering and paging steps to already fetched items.
    pub(crate) fn refine<R, F>(
        &self,
        mut items: Vec<R>,
        row_of: F,
        navigation: &dyn Navigation,
    ) -> AdapterResult<Vec<R>>
    where
        F: Fn(&R) -> &dyn Row,
    {
        let mut ordering: Vec<(&str, Direction)> = Vec::new();
        let mut unsorted = false;
        for step in &self.steps {
            if !matches!(step, Step::Order { .. }) && unsorted {
                sort_items(&mut items, &ordering, &row_of);
                unsorted = false;
            }
            match step {
                Step::Filter(predicate) => {
                    items = rewrite(predicate, navigation).filter(items, &row_of)?;
                }
                Step::Order {
                    field,
                    direction,
                    then,
                } => {
                    if !then {
                        ordering.clear();
                    }
                    ordering.push((field.as_str(), *direction));
                    unsorted = true;
                }
                Step::Skip(count) => {
                    let count = (*count).min(items.len());
                    items.drain(..count);
                }
                Step::Take(count) => items.truncate(*count),
            }
        }
        if unsorted {
            sort_items(&mut items, &ordering, &row_of);
        }
        Ok(items)
    }
}

fn sort_items<R, F>(items: &mut [R], keys: &[(&str, Direction)], row_of: &F)
where
    F: Fn(&R) -> &dyn Row,
{
    items.sort_by(|left, right| {
        let (left, right) = (row_of(left), row_of(right));
        for (field, direction) in keys {
            let ordering = order_values(left.value(field), right.value(field));
            let ordering = match direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

// Nulls sort first; incomparable kinds keep their relative order.
fn order_values(left: Option<Value>, right: Option<Value>) -> Ordering {
    match (left, right) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(left), Some(right)) => left.compare(&right).unwrap_or(Ordering::Equal),
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            specification: self.specification.clone(),
            steps: self.steps.clone(),
        }
    }
}

impl<T> Debug for Query<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("specification", &self.specification)
            .field("steps", &self.steps)
            .finish()
    }
}
