//! Adapter assembled from closures.

use crate::adapter::{
    AdapterError, AdapterResult, Command, CommandAdapter, CrudAdapter, QueryAdapter,
};
use crate::model::{Entity, IdentityKey, Value};
use crate::query::{Navigation, NoNavigation, Predicate};

type IdentityFn<T> = Box<dyn Fn(&T) -> IdentityKey>;
type CreateFn<T> = Box<dyn Fn(&mut T) -> AdapterResult<()>>;
type WriteFn<T> = Box<dyn Fn(&T) -> AdapterResult<()>>;
type ReadPredicateFn<T> = Box<dyn Fn(&Predicate, &dyn Navigation) -> AdapterResult<Vec<T>>>;
type ReadCommandFn<T> = Box<dyn Fn(&str, &[Value]) -> AdapterResult<Vec<T>>>;
type ExecuteFn = Box<dyn Fn(&Command) -> AdapterResult<usize>>;

/// Forwards every adapter call to a user closure.
///
/// Writes and non-query commands without a closure fail with
/// `AdapterError::Unsupported`. Without a command closure, read commands run
/// the predicate reader with `Predicate::False`.
pub struct DelegateAdapter<T: Entity> {
    identity: IdentityFn<T>,
    read_predicate: ReadPredicateFn<T>,
    read_command: Option<ReadCommandFn<T>>,
    create: Option<CreateFn<T>>,
    update: Option<WriteFn<T>>,
    delete: Option<WriteFn<T>>,
    execute: Option<ExecuteFn>,
}

impl<T: Entity> DelegateAdapter<T> {
    pub fn new(
        identity: impl Fn(&T) -> IdentityKey + 'static,
        read_predicate: impl Fn(&Predicate, &dyn Navigation) -> AdapterResult<Vec<T>> + 'static,
    ) -> Self {
        Self {
            identity: Box::new(identity),
            read_predicate: Box::new(read_predicate),
            read_command: None,
            create: None,
            update: None,
            delete: None,
            execute: None,
        }
    }

    pub fn on_create(mut self, create: impl Fn(&mut T) -> AdapterResult<()> + 'static) -> Self {
        self.create = Some(Box::new(create));
        self
    }

    pub fn on_update(mut self, update: impl Fn(&T) -> AdapterResult<()> + 'static) -> Self {
        self.update = Some(Box::new(update));
        self
    }

    pub fn on_delete(mut self, delete: impl Fn(&T) -> AdapterResult<()> + 'static) -> Self {
        self.delete = Some(Box::new(delete));
        self
    }

    pub fn on_command(
        mut self,
        command: impl Fn(&str, &[Value]) -> AdapterResult<Vec<T>> + 'static,
    ) -> Self {
        self.read_command = Some(Box::new(command));
        self
    }

    pub fn on_execute(
        mut self,
        execute: impl Fn(&Command) -> AdapterResult<usize> + 'static,
    ) -> Self {
        self.execute = Some(Box::new(execute));
        self
    }

    fn unsupported(operation: &str) -> AdapterError {
        AdapterError::Unsupported(format!("{operation} is not configured for `{}`", T::NAME))
    }
}

impl<T: Entity> QueryAdapter<T> for DelegateAdapter<T> {
    fn identity(&self, entity: &T) -> IdentityKey {
        (self.identity)(entity)
    }

    fn execute_predicate(
        &self,
        predicate: &Predicate,
        navigation: &dyn Navigation,
    ) -> AdapterResult<Vec<T>> {
        (self.read_predicate)(predicate, navigation)
    }

    fn execute_command(&self, command: &str, parameters: &[Value]) -> AdapterResult<Vec<T>> {
        match &self.read_command {
            Some(read_command) => read_command(command, parameters),
            None => (self.read_predicate)(&Predicate::False, &NoNavigation),
        }
    }
}

impl<T: Entity> CrudAdapter<T> for DelegateAdapter<T> {
    fn create(&self, entity: &mut T) -> AdapterResult<()> {
        match &self.create {
            Some(create) => create(entity),
            None => Err(Self::unsupported("create")),
        }
    }

    fn update(&self, entity: &T) -> AdapterResult<()> {
        match &self.update {
            Some(update) => update(entity),
            None => Err(Self::unsupported("update")),
        }
    }

    fn delete(&self, entity: &T) -> AdapterResult<()> {
        match &self.delete {
            Some(delete) => delete(entity),
            None => Err(Self::unsupported("delete")),
        }
    }

    fn read(&self) -> &dyn QueryAdapter<T> {
        self
    }
}

impl<T: Entity> CommandAdapter for DelegateAdapter<T> {
    fn execute_non_query(&self, command: &Command) -> AdapterResult<usize> {
        match &self.execute {
            Some(execute) => execute(command),
            None => Err(Self::unsupported("command execution")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DelegateAdapter;
    use crate::adapter::{AdapterError, Command, CommandAdapter, CrudAdapter, QueryAdapter};
    use crate::model::{IdentityKey, Row};
    use crate::query::{NoNavigation, Predicate};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Event {
        id: i64,
        kind: String,
    }

    crate::entity_fields!(Event as "event" => [id, kind]);

    fn seeded() -> Rc<RefCell<Vec<Event>>> {
        Rc::new(RefCell::new(vec![
            Event {
                id: 1,
                kind: "open".to_string(),
            },
            Event {
                id: 2,
                kind: "close".to_string(),
            },
        ]))
    }

    fn reader(rows: Rc<RefCell<Vec<Event>>>) -> DelegateAdapter<Event> {
        DelegateAdapter::new(
            |event: &Event| IdentityKey::single(event.id),
            move |predicate, _navigation| {
                Ok(rows
                    .borrow()
                    .iter()
                    .filter(|event| predicate.matches(*event as &dyn Row))
                    .cloned()
                    .collect())
            },
        )
    }

    #[test]
    fn closures_receive_every_call() {
        let rows = seeded();
        let sink = rows.clone();
        let adapter = reader(rows.clone()).on_create(move |event| {
            event.id = 3;
            sink.borrow_mut().push(event.clone());
            Ok(())
        });

        let mut created = Event {
            id: 0,
            kind: "retry".to_string(),
        };
        adapter.create(&mut created).expect("create event");
        assert_eq!(created.id, 3);
        assert_eq!(rows.borrow().len(), 3);

        let found = adapter
            .execute_predicate(&Predicate::eq("kind", "close"), &NoNavigation)
            .expect("read events");
        assert_eq!(found.len(), 1);
        assert_eq!(adapter.identity(&found[0]), IdentityKey::single(2_i64));
    }

    #[test]
    fn missing_closures_report_unsupported() {
        let adapter = reader(seeded());
        assert!(matches!(
            adapter.update(&Event::default()),
            Err(AdapterError::Unsupported(_))
        ));
        assert!(adapter
            .execute_command("anything", &[])
            .expect("fallback command")
            .is_empty());
        assert!(matches!(
            adapter.execute_non_query(&Command::new("purge")),
            Err(AdapterError::Unsupported(_))
        ));
    }

    #[test]
    fn non_query_commands_reach_the_execute_closure() {
        let rows = seeded();
        let sink = rows.clone();
        let adapter = reader(rows.clone()).on_execute(move |command| {
            let kind = command.parameters().first().and_then(|value| value.as_text());
            let mut rows = sink.borrow_mut();
            let before = rows.len();
            rows.retain(|event| Some(event.kind.as_str()) != kind);
            Ok(before - rows.len())
        });

        let purge = Command::new("purge").bind("open");
        assert_eq!(adapter.execute_non_query(&purge).expect("purge"), 1);
        assert_eq!(rows.borrow().len(), 1);
        assert_eq!(rows.borrow()[0].id, 2);
    }
}
