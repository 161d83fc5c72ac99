//! Navigation-aware predicate evaluation.
//!
//! # Responsibility
//! - Rewrite `Related` predicate nodes into calls to a resolver that loads
//!   the related entities on demand.
//! - Let adapters evaluate relation predicates without knowing about the
//!   unit of work.
//!
//! # Invariants
//! - Rewriting never touches storage; resolution happens per row at
//!   evaluation time.
//! - An unmapped relation resolves to "no related entities".

use crate::adapter::AdapterResult;
use crate::model::Row;
use crate::query::predicate::Predicate;

/// Resolves relation fields of an entity into the related rows.
pub trait Navigation {
    /// Returns `Ok(None)` when `field` is not a mapped relation of `owner`.
    fn navigate(&self, owner: &dyn Row, field: &str) -> AdapterResult<Option<Vec<Box<dyn Row>>>>;
}

/// Resolver for contexts without relationship mappings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNavigation;

impl Navigation for NoNavigation {
    fn navigate(&self, _owner: &dyn Row, _field: &str) -> AdapterResult<Option<Vec<Box<dyn Row>>>> {
        Ok(None)
    }
}

/// Predicate bound to a navigation resolver.
pub struct NavigablePredicate<'a> {
    root: Node<'a>,
    navigation: &'a dyn Navigation,
}

enum Node<'a> {
    Constant(bool),
    And(Vec<Node<'a>>),
    Or(Vec<Node<'a>>),
    Not(Box<Node<'a>>),
    Scalar(&'a Predicate),
    Resolve { field: &'a str, inner: Box<Node<'a>> },
}

/// Binds `predicate` to `navigation`.
pub fn rewrite<'a>(predicate: &'a Predicate, navigation: &'a dyn Navigation) -> NavigablePredicate<'a> {
    NavigablePredicate {
        root: build(predicate),
        navigation,
    }
}

fn build(predicate: &Predicate) -> Node<'_> {
    if !predicate.has_navigation() {
        return match predicate {
            Predicate::True => Node::Constant(true),
            Predicate::False => Node::Constant(false),
            other => Node::Scalar(other),
        };
    }
    match predicate {
        Predicate::And(children) => Node::And(children.iter().map(build).collect()),
        Predicate::Or(children) => Node::Or(children.iter().map(build).collect()),
        Predicate::Not(inner) => Node::Not(Box::new(build(inner))),
        Predicate::Related { field, predicate } => Node::Resolve {
            field: field.as_str(),
            inner: Box::new(build(predicate)),
        },
        other => Node::Scalar(other),
    }
}

impl NavigablePredicate<'_> {
    pub fn matches(&self, row: &dyn Row) -> AdapterResult<bool> {
        self.eval(&self.root, row)
    }

    /// Keeps the items whose row satisfies the predicate, preserving order.
    pub fn filter<R>(&self, items: Vec<R>, row_of: impl Fn(&R) -> &dyn Row) -> AdapterResult<Vec<R>> {
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            if self.matches(row_of(&item))? {
                kept.push(item);
            }
        }
        Ok(kept)
    }

    fn eval(&self, node: &Node<'_>, row: &dyn Row) -> AdapterResult<bool> {
        match node {
            Node::Constant(value) => Ok(*value),
            Node::Scalar(predicate) => Ok(predicate.matches(row)),
            Node::And(children) => {
                for child in children {
                    if !self.eval(child, row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Node::Or(children) => {
                for child in children {
                    if self.eval(child, row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Node::Not(inner) => Ok(!self.eval(inner, row)?),
            Node::Resolve { field, inner } => {
                let Some(related) = self.navigation.navigate(row, field)? else {
                    return Ok(false);
                };
                for candidate in &related {
                    if self.eval(inner, candidate.as_ref())? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{rewrite, Navigation, NoNavigation};
    use crate::adapter::AdapterResult;
    use crate::model::Row;
    use crate::query::predicate::Predicate;
    use std::cell::Cell;

    #[derive(Debug, Clone, Default)]
    struct Parent {
        id: i64,
    }

    #[derive(Debug, Clone, Default)]
    struct Child {
        parent_id: i64,
        name: String,
    }

    crate::entity_fields!(Parent as "parent" => [id]);
    crate::entity_fields!(Child as "child" => [parent_id, name]);

    struct Children {
        rows: Vec<Child>,
        calls: Cell<usize>,
    }

    impl Navigation for Children {
        fn navigate(&self, owner: &dyn Row, field: &str) -> AdapterResult<Option<Vec<Box<dyn Row>>>> {
            self.calls.set(self.calls.get() + 1);
            if field != "children" {
                return Ok(None);
            }
            let owner_id = owner.value("id");
            Ok(Some(
                self.rows
                    .iter()
                    .filter(|child| owner_id == child.value("parent_id"))
                    .map(|child| Box::new(child.clone()) as Box<dyn Row>)
                    .collect(),
            ))
        }
    }

    fn children() -> Children {
        Children {
            rows: vec![
                Child {
                    parent_id: 1,
                    name: "a".to_string(),
                },
                Child {
                    parent_id: 2,
                    name: "b".to_string(),
                },
            ],
            calls: Cell::new(0),
        }
    }

    #[test]
    fn related_nodes_resolve_through_navigation() {
        let navigation = children();
        let predicate = Predicate::related("children", Predicate::eq("name", "b"));
        let bound = rewrite(&predicate, &navigation);

        assert!(!bound.matches(&Parent { id: 1 }).expect("evaluate parent 1"));
        assert!(bound.matches(&Parent { id: 2 }).expect("evaluate parent 2"));
        assert_eq!(navigation.calls.get(), 2);
    }

    #[test]
    fn scalar_branches_skip_navigation() {
        let navigation = children();
        let predicate = Predicate::eq("id", 5)
            .or(Predicate::related("children", Predicate::True));
        let bound = rewrite(&predicate, &navigation);

        assert!(bound.matches(&Parent { id: 5 }).expect("evaluate"));
        assert_eq!(navigation.calls.get(), 0);
    }

    #[test]
    fn unmapped_relations_resolve_to_no_match() {
        let predicate = Predicate::related("children", Predicate::True);
        let bound = rewrite(&predicate, &NoNavigation);
        assert!(!bound.matches(&Parent { id: 1 }).expect("evaluate"));
        let negated = predicate.clone().negate();
        assert!(rewrite(&negated, &NoNavigation)
            .matches(&Parent { id: 1 })
            .expect("evaluate negation"));
    }

    #[test]
    fn filter_preserves_input_order() {
        let navigation = children();
        let predicate = Predicate::related("children", Predicate::True);
        let parents = vec![Parent { id: 2 }, Parent { id: 3 }, Parent { id: 1 }];
        let kept = rewrite(&predicate, &navigation)
            .filter(parents, |parent| parent as &dyn Row)
            .expect("filter parents");
        let ids: Vec<i64> = kept.iter().map(|parent| parent.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }
}
