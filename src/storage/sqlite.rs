//! `SQLite`-backed [`Persistence`].

use std::sync::Mutex;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;

use super::persistence::{Condition, Persistence, Query, Row, WriteOp};
use super::Database;
use crate::error::QueueError;

/// [`Persistence`] over one `SQLite` connection.
pub struct SqlitePersistence {
    db: Mutex<Database>,
}

impl SqlitePersistence {
    /// Wrap an opened (and migrated) database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Open the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_at(path: &std::path::Path) -> Result<Self, QueueError> {
        Database::open_at(path).map(Self::new)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        Database::open_in_memory().map(Self::new)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Database> {
        self.db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Reject anything that is not a plain identifier before it reaches SQL text.
fn ident(name: &str) -> Result<&str, QueueError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(QueueError::Database(format!("Invalid identifier: {name:?}")))
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n.as_i64().map_or_else(
            || SqlValue::Real(n.as_f64().unwrap_or_default()),
            SqlValue::Integer,
        ),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        },
    }
}

/// Build a `WHERE` clause; parameters are appended to `params`.
fn where_clause(filters: &[Condition], params: &mut Vec<SqlValue>) -> Result<String, QueueError> {
    if filters.is_empty() {
        return Ok(String::new());
    }
    let mut parts = Vec::with_capacity(filters.len());
    for condition in filters {
        let column = ident(condition.column())?;
        let part = match condition {
            Condition::Eq(_, Value::Null) => format!("{column} IS NULL"),
            Condition::Eq(_, value) => {
                params.push(to_sql(value));
                format!("{column} = ?{}", params.len())
            },
            Condition::Lt(_, value) => {
                params.push(to_sql(value));
                format!("{column} < ?{}", params.len())
            },
            Condition::In(_, values) if values.is_empty() => "0".to_string(),
            Condition::In(_, values) => {
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| {
                        params.push(to_sql(v));
                        format!("?{}", params.len())
                    })
                    .collect();
                format!("{column} IN ({})", placeholders.join(", "))
            },
        };
        parts.push(part);
    }
    Ok(format!(" WHERE {}", parts.join(" AND ")))
}

fn insert_row(conn: &Connection, table: &str, row: &Row) -> Result<usize, QueueError> {
    let table = ident(table)?;
    let mut columns = Vec::with_capacity(row.len());
    let mut placeholders = Vec::with_capacity(row.len());
    let mut params = Vec::with_capacity(row.len());
    for (column, value) in row {
        columns.push(ident(column)?);
        params.push(to_sql(value));
        placeholders.push(format!("?{}", params.len()));
    }
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(params))
        .map_err(|e| QueueError::Database(format!("Insert into {table} failed: {e}")))
}

fn update_rows(
    conn: &Connection,
    table: &str,
    row: &Row,
    filters: &[Condition],
) -> Result<usize, QueueError> {
    let table = ident(table)?;
    if row.is_empty() {
        return Ok(0);
    }
    let mut params = Vec::with_capacity(row.len());
    let mut assignments = Vec::with_capacity(row.len());
    for (column, value) in row {
        let column = ident(column)?;
        params.push(to_sql(value));
        assignments.push(format!("{column} = ?{}", params.len()));
    }
    let clause = where_clause(filters, &mut params)?;
    let sql = format!("UPDATE {table} SET {}{clause}", assignments.join(", "));
    conn.execute(&sql, params_from_iter(params))
        .map_err(|e| QueueError::Database(format!("Update of {table} failed: {e}")))
}

fn delete_rows(conn: &Connection, table: &str, filters: &[Condition]) -> Result<usize, QueueError> {
    let table = ident(table)?;
    let mut params = Vec::new();
    let clause = where_clause(filters, &mut params)?;
    let sql = format!("DELETE FROM {table}{clause}");
    conn.execute(&sql, params_from_iter(params))
        .map_err(|e| QueueError::Database(format!("Delete from {table} failed: {e}")))
}

fn apply(conn: &Connection, op: &WriteOp) -> Result<usize, QueueError> {
    match op {
        WriteOp::Insert { table, row } => insert_row(conn, table, row),
        WriteOp::Update { table, row, filters } => update_rows(conn, table, row, filters),
        WriteOp::Delete { table, filters } => delete_rows(conn, table, filters),
    }
}

impl Persistence for SqlitePersistence {
    fn insert(&self, table: &str, row: &Row) -> Result<(), QueueError> {
        insert_row(self.lock().connection(), table, row).map(|_| ())
    }

    fn update(&self, table: &str, row: &Row, filters: &[Condition]) -> Result<usize, QueueError> {
        update_rows(self.lock().connection(), table, row, filters)
    }

    fn delete(&self, table: &str, filters: &[Condition]) -> Result<usize, QueueError> {
        delete_rows(self.lock().connection(), table, filters)
    }

    fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>, QueueError> {
        let table = ident(table)?;
        let mut params = Vec::new();
        let mut sql = format!("SELECT * FROM {table}");
        sql.push_str(&where_clause(&query.filters, &mut params)?);
        if let Some(column) = &query.order_by {
            sql.push_str(&format!(" ORDER BY {}", ident(column)?));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let db = self.lock();
        let mut stmt = db.connection().prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt.query_map(params_from_iter(params), |r| {
            let mut row = Row::new();
            for (i, column) in columns.iter().enumerate() {
                row.insert(column.clone(), from_sql(r.get_ref(i)?));
            }
            Ok(row)
        })?;

        let collected = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QueueError::Database(format!("Query on {table} failed: {e}")));
        collected
    }

    fn run_in_transaction(&self, ops: &[WriteOp]) -> Result<(), QueueError> {
        let mut db = self.lock();
        let tx = db
            .connection_mut()
            .transaction()
            .map_err(|e| QueueError::Database(format!("Failed to begin transaction: {e}")))?;
        for op in ops {
            apply(&tx, op)?;
        }
        tx.commit()
            .map_err(|e| QueueError::Database(format!("Commit failed: {e}")))
    }
}
