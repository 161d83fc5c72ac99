//! Context facades: a tracking data context and a read-only query context.
//!
//! # Responsibility
//! - Provide the find/add/update/delete/save entry points most callers need.
//! - Delegate tracking and persistence to the wrapped `UnitOfWork`.
//! - Serve untracked reads and commands through `QueryContext`.
//!
//! # Invariants
//! - `DataContext` persists entities only in `save_changes`; `execute` runs
//!   commands immediately.
//! - `QueryContext` never tracks, marks or caches what it returns.

use crate::adapter::{Command, CommandAdapter, QueryAdapter};
use crate::error::{StoreError, StoreResult};
use crate::model::{Entity, EntityType};
use crate::query::{NoNavigation, Query, Specification};
use crate::tracking::{CommitReport, EntityId, EntityRef, Notification, UnitOfWork};
use log::{error, info};
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

/// Session-style wrapper around one unit of work.
pub struct DataContext {
    uow: UnitOfWork,
}

impl DataContext {
    /// Creates a context over a unit of work with adapters already
    /// registered.
    pub fn new(uow: UnitOfWork) -> Self {
        Self { uow }
    }

    /// Loads every entity satisfying `specification`.
    pub fn find<T: Entity>(
        &mut self,
        specification: impl Into<Specification<T>>,
    ) -> StoreResult<Vec<EntityRef<T>>> {
        self.uow.find(specification).load(&mut self.uow)
    }

    /// Deferred query for further composition.
    pub fn query<T: Entity>(&self, specification: impl Into<Specification<T>>) -> Query<T> {
        self.uow.find(specification)
    }

    pub fn find_single<T: Entity>(
        &mut self,
        specification: impl Into<Specification<T>>,
    ) -> StoreResult<Option<EntityRef<T>>> {
        self.uow.find_single(specification)
    }

    pub fn get<T: Entity>(&self, entity: EntityRef<T>) -> Option<&T> {
        self.uow.get(entity)
    }

    pub fn get_mut<T: Entity>(&mut self, entity: EntityRef<T>) -> Option<&mut T> {
        self.uow.get_mut(entity)
    }

    /// Tracks `entity` for creation on the next save.
    pub fn add<T: Entity>(&mut self, entity: T) -> StoreResult<EntityRef<T>> {
        self.uow.add(entity)
    }

    pub fn update(&mut self, entity: impl Into<EntityId>) -> StoreResult<()> {
        self.uow.mark_modified(entity)
    }

    pub fn delete(&mut self, entity: impl Into<EntityId>) -> StoreResult<()> {
        self.uow.mark_deleted(entity)
    }

    /// Commits every pending change.
    pub fn save_changes(&mut self) -> StoreResult<CommitReport> {
        self.uow.commit()
    }

    /// Runs a non-query command now, ahead of any pending changes.
    pub fn execute(&mut self, command: &Command) -> StoreResult<usize> {
        self.uow.execute_command(command)
    }

    /// Receives materialize/create/update/delete notifications.
    pub fn subscribe(&mut self, observer: impl FnMut(&Notification) + 'static) {
        self.uow.subscribe(observer);
    }

    pub fn uow(&self) -> &UnitOfWork {
        &self.uow
    }

    pub fn uow_mut(&mut self) -> &mut UnitOfWork {
        &mut self.uow
    }

    pub fn into_inner(self) -> UnitOfWork {
        self.uow
    }
}

impl From<UnitOfWork> for DataContext {
    fn from(value: UnitOfWork) -> Self {
        Self::new(value)
    }
}

/// Read-only context over registered query adapters.
///
/// Results are plain values. Relation predicates are rejected because no
/// relationship map is available.
#[derive(Default)]
pub struct QueryContext {
    readers: HashMap<EntityType, Box<dyn Any>>,
    commands: Option<Rc<dyn CommandAdapter>>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the reader for `T`; the first registration wins.
    pub fn register<T: Entity>(&mut self, adapter: Rc<dyn QueryAdapter<T>>) -> bool {
        let entity_type = EntityType::of::<T>();
        let added = !self.readers.contains_key(&entity_type);
        if added {
            self.readers.insert(entity_type, Box::new(adapter));
        }
        info!(
            "event=query_context_register module=context status={} entity={entity_type}",
            if added { "ok" } else { "ignored" }
        );
        added
    }

    pub fn is_registered<T: Entity>(&self) -> bool {
        self.readers.contains_key(&EntityType::of::<T>())
    }

    pub fn with_command_target(mut self, commands: Rc<dyn CommandAdapter>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn find<T: Entity>(
        &self,
        specification: impl Into<Specification<T>>,
    ) -> StoreResult<Vec<T>> {
        self.fetch(&Query::new(specification.into()))
    }

    pub fn find_single<T: Entity>(
        &self,
        specification: impl Into<Specification<T>>,
    ) -> StoreResult<Option<T>> {
        let first = Query::new(specification.into()).take(1);
        Ok(self.fetch(&first)?.into_iter().next())
    }

    /// Runs a composed query against the registered reader.
    pub fn fetch<T: Entity>(&self, query: &Query<T>) -> StoreResult<Vec<T>> {
        query.fetch(self.reader::<T>()?, &NoNavigation)
    }

    pub fn execute(&self, command: &Command) -> StoreResult<usize> {
        let commands = self.commands.as_ref().ok_or(StoreError::NoCommandTarget)?;
        commands.execute_non_query(command).map_err(|err| {
            error!("event=query_context_execute module=context status=error error={err}");
            StoreError::Command(err)
        })
    }

    fn reader<T: Entity>(&self) -> StoreResult<&dyn QueryAdapter<T>> {
        self.readers
            .get(&EntityType::of::<T>())
            .and_then(|reader| reader.downcast_ref::<Rc<dyn QueryAdapter<T>>>())
            .map(|reader| reader.as_ref())
            .ok_or(StoreError::NotRegistered(T::NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::{DataContext, QueryContext};
    use crate::adapter::{Command, InMemoryAdapter};
    use crate::error::StoreError;
    use crate::model::Value;
    use crate::query::{Predicate, Query, Specification};
    use crate::tracking::UnitOfWork;
    use std::rc::Rc;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Note {
        id: i64,
        body: String,
        pinned: bool,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Label {
        id: i64,
    }

    crate::entity_fields!(Note as "note" => [id, body, pinned]);
    crate::entity_fields!(Label as "label" => [id]);

    fn note(id: i64, body: &str) -> Note {
        Note {
            id,
            body: body.to_string(),
            pinned: false,
        }
    }

    fn notes() -> Rc<InMemoryAdapter<Note>> {
        Rc::new(
            InMemoryAdapter::new(&["id"])
                .with_rows([note(1, "alpha"), note(2, "beta"), note(3, "gamma")])
                .with_mutation("pin", |rows: &mut Vec<Note>, params: &[Value]| {
                    let wanted = params.first().and_then(Value::as_int);
                    let mut affected = 0;
                    for row in rows.iter_mut().filter(|row| Some(row.id) == wanted) {
                        row.pinned = true;
                        affected += 1;
                    }
                    affected
                }),
        )
    }

    #[test]
    fn query_context_reads_registered_types_only() {
        let adapter = notes();
        let mut ctx = QueryContext::new();
        assert!(ctx.register::<Note>(adapter.clone()));
        assert!(!ctx.register::<Note>(Rc::new(InMemoryAdapter::<Note>::new(&["id"]))));
        assert!(ctx.is_registered::<Note>());
        assert!(!ctx.is_registered::<Label>());

        let found = ctx.find::<Note>(Predicate::gt("id", 1)).expect("find notes");
        assert_eq!(found, vec![note(2, "beta"), note(3, "gamma")]);
        let single = ctx
            .find_single::<Note>(Predicate::eq("body", "alpha"))
            .expect("find alpha");
        assert_eq!(single, Some(note(1, "alpha")));
        let last = ctx
            .fetch(&Query::new(Specification::<Note>::all()).order_by_desc("id").take(1))
            .expect("fetch last");
        assert_eq!(last, vec![note(3, "gamma")]);

        assert!(matches!(
            ctx.find::<Label>(Predicate::True),
            Err(StoreError::NotRegistered("label"))
        ));
    }

    #[test]
    fn query_context_executes_through_its_command_target() {
        let adapter = notes();
        let mut ctx = QueryContext::new();
        ctx.register::<Note>(adapter.clone());
        let pin = Command::new("pin").bind(2_i64);
        assert!(matches!(ctx.execute(&pin), Err(StoreError::NoCommandTarget)));

        let ctx = ctx.with_command_target(adapter.clone());
        assert_eq!(ctx.execute(&pin).expect("pin note"), 1);
        let pinned = ctx.find::<Note>(Predicate::eq("pinned", true)).expect("find pinned");
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].id, 2);
    }

    #[test]
    fn data_context_executes_commands_before_saving() {
        let adapter = notes();
        let mut uow = UnitOfWork::new().with_command_target(adapter.clone());
        uow.register::<Note>(adapter.clone());
        let mut ctx = DataContext::new(uow);

        let loaded = ctx
            .find_single::<Note>(Predicate::eq("id", 3))
            .expect("find note")
            .expect("note 3");
        assert_eq!(ctx.execute(&Command::new("pin").bind(3_i64)).expect("pin"), 1);
        assert!(!ctx.get(loaded).expect("tracked note").pinned);
        assert!(adapter.rows()[2].pinned);
        assert_eq!(ctx.uow().pending_count(), 0);
    }
}
