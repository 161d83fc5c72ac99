//! Query specifications: a predicate or a named storage command.

use crate::adapter::{AdapterResult, QueryAdapter};
use crate::model::{Entity, Value};
use crate::query::navigation::Navigation;
use crate::query::predicate::Predicate;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;

/// What a specification asks the adapter to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Criteria {
    Predicate(Predicate),
    Command { text: String, parameters: Vec<Value> },
}

/// Selection criteria for entities of type `T`.
///
/// Composing a command-based specification with anything else yields a
/// specification that matches nothing.
pub struct Specification<T> {
    criteria: Criteria,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Specification<T> {
    pub fn new(predicate: Predicate) -> Self {
        Self::from_criteria(Criteria::Predicate(predicate))
    }

    /// Matches every entity.
    pub fn all() -> Self {
        Self::new(Predicate::True)
    }

    pub fn command(text: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self::from_criteria(Criteria::Command {
            text: text.into(),
            parameters,
        })
    }

    fn from_criteria(criteria: Criteria) -> Self {
        Self {
            criteria,
            _entity: PhantomData,
        }
    }

    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    pub fn is_command(&self) -> bool {
        matches!(self.criteria, Criteria::Command { .. })
    }

    /// Predicate form; commands have no predicate and yield `False`.
    pub fn predicate(&self) -> Predicate {
        match &self.criteria {
            Criteria::Predicate(predicate) => predicate.clone(),
            Criteria::Command { .. } => Predicate::False,
        }
    }

    pub fn and(self, other: impl Into<Specification<T>>) -> Self {
        let other = other.into();
        Self::new(self.predicate().and(other.predicate()))
    }

    pub fn or(self, other: impl Into<Specification<T>>) -> Self {
        let other = other.into();
        Self::new(self.predicate().or(other.predicate()))
    }

    /// Runs the specification against `adapter`.
    pub fn satisfying_entities_from(
        &self,
        adapter: &dyn QueryAdapter<T>,
        navigation: &dyn Navigation,
    ) -> AdapterResult<Vec<T>> {
        match &self.criteria {
            Criteria::Predicate(predicate) => adapter.execute_predicate(predicate, navigation),
            Criteria::Command { text, parameters } => adapter.execute_command(text, parameters),
        }
    }
}

impl<T: Entity> From<Predicate> for Specification<T> {
    fn from(predicate: Predicate) -> Self {
        Self::new(predicate)
    }
}

impl<T: Entity> Default for Specification<T> {
    fn default() -> Self {
        Self::all()
    }
}

impl<T> Clone for Specification<T> {
    fn clone(&self) -> Self {
        Self {
            criteria: self.criteria.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> Debug for Specification<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Specification")
            .field("criteria", &self.criteria)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Criteria, Specification};
    use crate::model::Value;
    use crate::query::predicate::Predicate;

    #[derive(Debug, Clone, Default)]
    struct Note {
        id: i64,
    }

    crate::entity_fields!(Note as "note" => [id]);

    #[test]
    fn predicates_compose() {
        let spec = Specification::<Note>::new(Predicate::gt("id", 1)).and(Predicate::lt("id", 9));
        assert_eq!(
            spec.predicate(),
            Predicate::gt("id", 1).and(Predicate::lt("id", 9))
        );
        assert!(!spec.is_command());
    }

    #[test]
    fn composing_a_command_matches_nothing() {
        let command = Specification::<Note>::command("by_tag", vec![Value::from("x")]);
        assert!(command.is_command());
        assert!(matches!(command.criteria(), Criteria::Command { .. }));

        let combined = command.clone().and(Predicate::True);
        assert_eq!(combined.predicate(), Predicate::False);
        let either = Specification::<Note>::new(Predicate::eq("id", 1)).or(command);
        assert_eq!(either.predicate(), Predicate::eq("id", 1));
    }
}
