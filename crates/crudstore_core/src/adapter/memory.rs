//! In-memory adapter backed by a vector of rows.
//!
//! # Responsibility
//! - Provide a complete `CrudAdapter` for tests, demos and caches.
//! - Record every write in a journal so callers can assert on commits.
//! - Run named mutations as non-query commands.
//!
//! # Invariants
//! - Row identity is the tuple of configured key fields.
//! - `KeyStrategy::Increment` assigns `max(existing) + 1` on create and
//!   fails instead of wrapping once the key space is exhausted.
//! - Named mutations bypass the journal; it only records entity writes.

use crate::adapter::{
    AdapterError, AdapterResult, Command, CommandAdapter, CrudAdapter, QueryAdapter,
};
use crate::model::{set_field, Entity, IdentityKey, Row, Value};
use crate::query::{rewrite, Navigation, Predicate};
use log::debug;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// How `create` obtains the key of a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// The entity already carries its key.
    Provided,
    /// The named integer field is assigned the next free value.
    Increment(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// One write observed by the adapter.
#[derive(Debug, Clone)]
pub struct Operation<T> {
    pub kind: OperationKind,
    pub entity: T,
}

type CommandFilter<T> = Box<dyn Fn(&T, &[Value]) -> bool>;
type Mutation<T> = Box<dyn Fn(&mut Vec<T>, &[Value]) -> usize>;

pub struct InMemoryAdapter<T: Entity> {
    key_fields: Vec<&'static str>,
    strategy: KeyStrategy,
    rows: RefCell<Vec<T>>,
    commands: HashMap<String, CommandFilter<T>>,
    mutations: HashMap<String, Mutation<T>>,
    journal: RefCell<Vec<Operation<T>>>,
    reads: Cell<usize>,
}

impl<T: Entity> InMemoryAdapter<T> {
    pub fn new(key_fields: &[&'static str]) -> Self {
        Self {
            key_fields: key_fields.to_vec(),
            strategy: KeyStrategy::Provided,
            rows: RefCell::new(Vec::new()),
            commands: HashMap::new(),
            mutations: HashMap::new(),
            journal: RefCell::new(Vec::new()),
            reads: Cell::new(0),
        }
    }

    /// Single integer key assigned on create.
    pub fn with_increment(key_field: &'static str) -> Self {
        let mut adapter = Self::new(&[key_field]);
        adapter.strategy = KeyStrategy::Increment(key_field);
        adapter
    }

    /// Seeds rows without journaling them.
    pub fn with_rows(self, rows: impl IntoIterator<Item = T>) -> Self {
        self.rows.borrow_mut().extend(rows);
        self
    }

    /// Registers a named command; rows for which `filter` returns true are
    /// returned by `execute_command(name, ..)`.
    pub fn with_command(
        mut self,
        name: impl Into<String>,
        filter: impl Fn(&T, &[Value]) -> bool + 'static,
    ) -> Self {
        self.commands.insert(name.into(), Box::new(filter));
        self
    }

    /// Registers a named non-query command. `mutation` edits the stored rows
    /// in place and returns how many it affected.
    pub fn with_mutation(
        mut self,
        name: impl Into<String>,
        mutation: impl Fn(&mut Vec<T>, &[Value]) -> usize + 'static,
    ) -> Self {
        self.mutations.insert(name.into(), Box::new(mutation));
        self
    }

    pub fn rows(&self) -> Vec<T> {
        self.rows.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.borrow().is_empty()
    }

    pub fn journal(&self) -> Vec<Operation<T>> {
        self.journal.borrow().clone()
    }

    pub fn operations(&self, kind: OperationKind) -> Vec<T> {
        self.journal
            .borrow()
            .iter()
            .filter(|operation| operation.kind == kind)
            .map(|operation| operation.entity.clone())
            .collect()
    }

    pub fn clear_journal(&self) {
        self.journal.borrow_mut().clear();
    }

    /// Number of predicate or command executions served so far.
    pub fn read_count(&self) -> usize {
        self.reads.get()
    }

    fn position(&self, key: &IdentityKey) -> Option<usize> {
        self.rows
            .borrow()
            .iter()
            .position(|row| &self.identity(row) == key)
    }

    fn next_key(&self, field: &str) -> AdapterResult<i64> {
        let highest = self
            .rows
            .borrow()
            .iter()
            .filter_map(|row| row.value(field).and_then(|value| value.as_int()))
            .max()
            .unwrap_or(0);
        highest.checked_add(1).ok_or_else(|| {
            AdapterError::Unsupported(format!(
                "key field `{}.{field}` has no integer left after {highest}",
                T::NAME
            ))
        })
    }

    fn record(&self, kind: OperationKind, entity: &T) {
        self.journal.borrow_mut().push(Operation {
            kind,
            entity: entity.clone(),
        });
    }
}

impl<T: Entity> QueryAdapter<T> for InMemoryAdapter<T> {
    fn identity(&self, entity: &T) -> IdentityKey {
        IdentityKey::from_row(entity, &self.key_fields)
    }

    fn execute_predicate(
        &self,
        predicate: &Predicate,
        navigation: &dyn Navigation,
    ) -> AdapterResult<Vec<T>> {
        self.reads.set(self.reads.get() + 1);
        let candidates = self.rows();
        rewrite(predicate, navigation).filter(candidates, |row| row as &dyn Row)
    }

    fn execute_command(&self, command: &str, parameters: &[Value]) -> AdapterResult<Vec<T>> {
        self.reads.set(self.reads.get() + 1);
        let Some(matches_command) = self.commands.get(command) else {
            debug!(
                "event=adapter_command module=adapter status=unknown entity={} command={command}",
                T::NAME
            );
            return Ok(Vec::new());
        };
        Ok(self
            .rows
            .borrow()
            .iter()
            .filter(|row| matches_command(*row, parameters))
            .cloned()
            .collect())
    }
}

impl<T: Entity> CrudAdapter<T> for InMemoryAdapter<T> {
    fn create(&self, entity: &mut T) -> AdapterResult<()> {
        if let KeyStrategy::Increment(field) = self.strategy {
            let next = self.next_key(field)?;
            if !set_field(entity, field, Value::Int(next)) {
                return Err(AdapterError::InvalidData(format!(
                    "key field `{}.{field}` cannot hold an integer",
                    T::NAME
                )));
            }
        }
        let key = self.identity(entity);
        if self.position(&key).is_some() {
            return Err(AdapterError::Duplicate(key));
        }
        self.rows.borrow_mut().push(entity.clone());
        self.record(OperationKind::Create, entity);
        Ok(())
    }

    fn update(&self, entity: &T) -> AdapterResult<()> {
        let key = self.identity(entity);
        let index = self.position(&key).ok_or(AdapterError::NotFound(key))?;
        self.rows.borrow_mut()[index] = entity.clone();
        self.record(OperationKind::Update, entity);
        Ok(())
    }

    fn delete(&self, entity: &T) -> AdapterResult<()> {
        let key = self.identity(entity);
        let index = self.position(&key).ok_or(AdapterError::NotFound(key))?;
        self.rows.borrow_mut().remove(index);
        self.record(OperationKind::Delete, entity);
        Ok(())
    }

    fn read(&self) -> &dyn QueryAdapter<T> {
        self
    }
}

impl<T: Entity> CommandAdapter for InMemoryAdapter<T> {
    fn execute_non_query(&self, command: &Command) -> AdapterResult<usize> {
        let mutation = self.mutations.get(command.text()).ok_or_else(|| {
            AdapterError::Unsupported(format!(
                "no mutation named `{}` for `{}`",
                command.text(),
                T::NAME
            ))
        })?;
        let affected = mutation(&mut *self.rows.borrow_mut(), command.parameters());
        debug!(
            "event=adapter_execute module=adapter status=ok entity={} parameters={} affected={affected}",
            T::NAME,
            command.parameters().len()
        );
        Ok(affected)
    }
}
