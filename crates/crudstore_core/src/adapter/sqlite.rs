//! SQLite-backed adapter.
//!
//! # Responsibility
//! - Map one entity type onto one table, column names equal to field names.
//! - Compile scalar predicates into parameterized `WHERE` clauses.
//!
//! # Invariants
//! - Values are always bound as parameters; only identifiers are inlined,
//!   and those are quoted.
//! - Relation predicates are rejected; SQL has no access to the unit of
//!   work's relationship map.
//! - Columns without a matching field are ignored when reading rows.
//!
//! # See also
//! - crate::db::open_db for connection bootstrap.

use crate::adapter::{
    AdapterError, AdapterResult, Command, CommandAdapter, CrudAdapter, QueryAdapter,
};
use crate::model::{field, set_field, Entity, IdentityKey, Value};
use crate::query::{CompareOp, Navigation, Predicate};
use log::debug;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use std::marker::PhantomData;
use std::rc::Rc;

pub struct SqliteAdapter<T: Entity> {
    conn: Rc<Connection>,
    table: String,
    key_fields: Vec<&'static str>,
    auto_increment: bool,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> SqliteAdapter<T> {
    pub fn new(conn: Rc<Connection>, table: impl Into<String>, key_fields: &[&'static str]) -> Self {
        Self {
            conn,
            table: table.into(),
            key_fields: key_fields.to_vec(),
            auto_increment: false,
            _entity: PhantomData,
        }
    }

    /// Omits the key column on insert and writes back `last_insert_rowid`.
    ///
    /// Only meaningful for a single integer key.
    pub fn with_auto_increment(mut self) -> Self {
        self.auto_increment = self.key_fields.len() == 1;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn column_list(&self, fields: &[&str]) -> String {
        fields
            .iter()
            .map(|name| quote_identifier(name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn select_sql(&self) -> String {
        let fields: Vec<&str> = T::fields().iter().map(|field| field.name).collect();
        format!(
            "SELECT {} FROM {}",
            self.column_list(&fields),
            quote_identifier(&self.table)
        )
    }

    fn key_clause(&self, entity: &T, params: &mut Vec<SqlValue>) -> AdapterResult<String> {
        let mut parts = Vec::with_capacity(self.key_fields.len());
        for name in &self.key_fields {
            parts.push(format!("{} = ?", quote_identifier(name)));
            params.push(to_sql_value(&read_field(entity, name))?);
        }
        Ok(parts.join(" AND "))
    }

    fn is_key(&self, name: &str) -> bool {
        self.key_fields.iter().any(|key| *key == name)
    }

    fn query_rows(&self, sql: &str, params: Vec<SqlValue>) -> AdapterResult<Vec<T>> {
        debug!(
            "event=adapter_query module=adapter status=start entity={} table={} params={}",
            T::NAME,
            self.table,
            params.len()
        );
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(ToString::to_string)
            .collect();
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            let mut entity = T::default();
            for (index, column) in columns.iter().enumerate() {
                if field::<T>(column).is_none() {
                    continue;
                }
                let value = from_sql_value(row.get::<_, SqlValue>(index)?, column)?;
                if !set_field(&mut entity, column, value) {
                    return Err(AdapterError::InvalidData(format!(
                        "column `{}.{column}` does not fit field type of `{}`",
                        self.table,
                        T::NAME
                    )));
                }
            }
            entities.push(entity);
        }
        Ok(entities)
    }
}

impl<T: Entity> QueryAdapter<T> for SqliteAdapter<T> {
    fn identity(&self, entity: &T) -> IdentityKey {
        IdentityKey::from_row(entity, &self.key_fields)
    }

    fn execute_predicate(
        &self,
        predicate: &Predicate,
        _navigation: &dyn Navigation,
    ) -> AdapterResult<Vec<T>> {
        let mut params = Vec::new();
        let clause = compile_predicate(predicate, &mut params)?;
        let sql = format!("{} WHERE {clause}", self.select_sql());
        self.query_rows(&sql, params)
    }

    fn execute_command(&self, command: &str, parameters: &[Value]) -> AdapterResult<Vec<T>> {
        let params = parameters
            .iter()
            .map(to_sql_value)
            .collect::<AdapterResult<Vec<_>>>()?;
        self.query_rows(command, params)
    }
}

impl<T: Entity> CrudAdapter<T> for SqliteAdapter<T> {
    fn create(&self, entity: &mut T) -> AdapterResult<()> {
        let fields: Vec<&str> = T::fields()
            .iter()
            .map(|field| field.name)
            .filter(|name| !(self.auto_increment && self.is_key(name)))
            .collect();
        let params = fields
            .iter()
            .map(|name| to_sql_value(&read_field(entity, name)))
            .collect::<AdapterResult<Vec<_>>>()?;
        let placeholders = vec!["?"; fields.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders});",
            quote_identifier(&self.table),
            self.column_list(&fields)
        );
        self.conn.execute(&sql, params_from_iter(params))?;

        if self.auto_increment {
            let key = self.key_fields[0];
            let rowid = self.conn.last_insert_rowid();
            if !set_field(entity, key, Value::Int(rowid)) {
                return Err(AdapterError::InvalidData(format!(
                    "key field `{}.{key}` cannot hold a rowid",
                    T::NAME
                )));
            }
        }
        Ok(())
    }

    fn update(&self, entity: &T) -> AdapterResult<()> {
        let mut params = Vec::new();
        let mut assignments = Vec::new();
        for field in T::fields().iter().filter(|field| !self.is_key(field.name)) {
            assignments.push(format!("{} = ?", quote_identifier(field.name)));
            params.push(to_sql_value(&(field.get)(entity))?);
        }
        if assignments.is_empty() {
            return Ok(());
        }
        let key_clause = self.key_clause(entity, &mut params)?;
        let sql = format!(
            "UPDATE {} SET {} WHERE {key_clause};",
            quote_identifier(&self.table),
            assignments.join(", ")
        );
        let changed = self.conn.execute(&sql, params_from_iter(params))?;
        if changed == 0 {
            return Err(AdapterError::NotFound(self.identity(entity)));
        }
        Ok(())
    }

    fn delete(&self, entity: &T) -> AdapterResult<()> {
        let mut params = Vec::new();
        let key_clause = self.key_clause(entity, &mut params)?;
        let sql = format!(
            "DELETE FROM {} WHERE {key_clause};",
            quote_identifier(&self.table)
        );
        let changed = self.conn.execute(&sql, params_from_iter(params))?;
        if changed == 0 {
            return Err(AdapterError::NotFound(self.identity(entity)));
        }
        Ok(())
    }

    fn read(&self) -> &dyn QueryAdapter<T> {
        self
    }
}

impl<T: Entity> CommandAdapter for SqliteAdapter<T> {
    fn execute_non_query(&self, command: &Command) -> AdapterResult<usize> {
        let params = command
            .parameters()
            .iter()
            .map(to_sql_value)
            .collect::<AdapterResult<Vec<_>>>()?;
        let affected = self.conn.execute(command.text(), params_from_iter(params))?;
        debug!(
            "event=adapter_execute module=adapter status=ok table={} parameters={} affected={affected}",
            self.table,
            command.parameters().len()
        );
        Ok(affected)
    }
}

fn read_field<T: Entity>(entity: &T, name: &str) -> Value {
    field::<T>(name).map_or(Value::Null, |field| (field.get)(entity))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn compile_predicate(
    predicate: &Predicate,
    params: &mut Vec<SqlValue>,
) -> AdapterResult<String> {
    match predicate {
        Predicate::True => Ok("1 = 1".to_string()),
        Predicate::False => Ok("1 = 0".to_string()),
        Predicate::And(children) => compile_group(children, " AND ", "1 = 1", params),
        Predicate::Or(children) => compile_group(children, " OR ", "1 = 0", params),
        Predicate::Not(inner) => Ok(format!("NOT ({})", compile_predicate(inner, params)?)),
        Predicate::IsNull { field } => Ok(format!("{} IS NULL", quote_identifier(field))),
        Predicate::Compare(comparison) => {
            let column = quote_identifier(&comparison.field);
            let value = &comparison.value;
            let sql = match (comparison.op, value) {
                (CompareOp::Eq, Value::Null) => format!("{column} IS NULL"),
                (CompareOp::Ne, Value::Null) => format!("{column} IS NOT NULL"),
                (CompareOp::In, Value::List(items)) => {
                    if items.is_empty() {
                        return Ok("1 = 0".to_string());
                    }
                    for item in items {
                        params.push(to_sql_value(item)?);
                    }
                    format!("{column} IN ({})", vec!["?"; items.len()].join(", "))
                }
                (CompareOp::In, other) => {
                    return Err(AdapterError::Unsupported(format!(
                        "`in` expects a list, got {other}"
                    )));
                }
                (CompareOp::Contains, Value::Text(_)) => {
                    params.push(to_sql_value(value)?);
                    format!("instr({column}, ?) > 0")
                }
                (CompareOp::StartsWith, Value::Text(prefix)) => {
                    params.push(SqlValue::Integer(prefix.chars().count() as i64));
                    params.push(to_sql_value(value)?);
                    format!("substr({column}, 1, ?) = ?")
                }
                (CompareOp::Contains | CompareOp::StartsWith, other) => {
                    return Err(AdapterError::Unsupported(format!(
                        "text operator on non-text value {other}"
                    )));
                }
                (op, value) => {
                    params.push(to_sql_value(value)?);
                    format!("{column} {} ?", sql_operator(op))
                }
            };
            Ok(sql)
        }
        Predicate::Related { field, .. } => Err(AdapterError::Unsupported(format!(
            "relation predicate on `{field}` cannot run in SQL"
        ))),
    }
}

fn compile_group(
    children: &[Predicate],
    separator: &str,
    empty: &str,
    params: &mut Vec<SqlValue>,
) -> AdapterResult<String> {
    if children.is_empty() {
        return Ok(empty.to_string());
    }
    let mut parts = Vec::with_capacity(children.len());
    for child in children {
        parts.push(compile_predicate(child, params)?);
    }
    Ok(format!("({})", parts.join(separator)))
}

fn sql_operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "<>",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
        CompareOp::In | CompareOp::Contains | CompareOp::StartsWith => "=",
    }
}

fn to_sql_value(value: &Value) -> AdapterResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Int(number) => SqlValue::Integer(*number),
        Value::Float(number) => SqlValue::Real(*number),
        Value::Text(text) => SqlValue::Text(text.clone()),
        Value::Uuid(id) => SqlValue::Text(id.to_string()),
        Value::List(_) => {
            return Err(AdapterError::Unsupported(
                "list values cannot be bound as a single parameter".to_string(),
            ))
        }
    })
}

fn from_sql_value(value: SqlValue, column: &str) -> AdapterResult<Value> {
    match value {
        SqlValue::Null => Ok(Value::Null),
        SqlValue::Integer(number) => Ok(Value::Int(number)),
        SqlValue::Real(number) => Ok(Value::Float(number)),
        SqlValue::Text(text) => Ok(Value::Text(text)),
        SqlValue::Blob(_) => Err(AdapterError::InvalidData(format!(
            "blob column `{column}` has no field representation"
        ))),
    }
}
