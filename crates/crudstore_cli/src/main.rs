//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `crudstore_core` linkage.
//! - Run one add/load/update/commit round trip against in-memory SQLite,
//!   then clean up with a non-query command.
//! - Keep output deterministic for quick local sanity checks.

use crudstore_core::{
    default_log_level, init_logging, open_db_in_memory, Command, Predicate, SqliteAdapter,
    UnitOfWork,
};
use std::error::Error;
use std::rc::Rc;

#[derive(Debug, Clone, Default)]
struct Note {
    id: i64,
    title: String,
}

crudstore_core::entity_fields!(Note as "note" => [id, title]);

fn main() -> Result<(), Box<dyn Error>> {
    println!("crudstore_core ping={}", crudstore_core::ping());
    println!("crudstore_core version={}", crudstore_core::core_version());

    if std::env::args().nth(1).as_deref() != Some("demo") {
        return Ok(());
    }

    let log_dir = std::env::temp_dir().join("crudstore-cli-logs");
    if let Err(err) = init_logging(default_log_level(), &log_dir.to_string_lossy()) {
        eprintln!("logging disabled: {err}");
    }

    let conn = Rc::new(open_db_in_memory()?);
    conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL);")?;

    let notes =
        Rc::new(SqliteAdapter::<Note>::new(Rc::clone(&conn), "notes", &["id"]).with_auto_increment());
    let mut uow = UnitOfWork::new().with_command_target(notes.clone());
    uow.register::<Note>(notes);

    uow.add(Note {
        id: 0,
        title: "draft".to_string(),
    })?;
    let created = uow.commit()?;
    println!("demo created={}", created.created);

    if let Some(note) = uow.find_single::<Note>(Predicate::eq("title", "draft"))? {
        if let Some(loaded) = uow.get_mut(note) {
            loaded.title = "published".to_string();
        }
    }
    let updated = uow.commit()?;
    println!("demo updated={}", updated.updated);
    let cleanup = Command::new("DELETE FROM notes WHERE title = ?1").bind("published");
    let removed = uow.execute_command(&cleanup)?;
    println!("demo removed={removed}");
    log::info!(
        "event=cli_demo module=cli status=ok created={} updated={} removed={removed}",
        created.created,
        updated.updated
    );
    Ok(())
}
