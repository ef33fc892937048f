//! Generic row-store contract consumed by the queue.
//!
//! The queue core never writes SQL. It talks to a [`Persistence`]
//! implementation in terms of tables, JSON rows and simple conditions.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;

use serde_json::Value;

use crate::error::QueueError;

/// One stored row, column name to value.
pub type Row = serde_json::Map<String, Value>;

/// A filter on one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = value`
    Eq(String, Value),
    /// `column < value`
    Lt(String, Value),
    /// `column IN (values)`; an empty list matches nothing
    In(String, Vec<Value>),
}

impl Condition {
    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    /// `column < value`
    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(column.into(), value.into())
    }

    /// `column IN (values)`
    pub fn is_in<V: Into<Value>>(column: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    /// Column the condition applies to.
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Eq(c, _) | Self::Lt(c, _) | Self::In(c, _) => c,
        }
    }

    /// Evaluate against an in-memory row.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Self::Eq(_, expected) => actual == expected,
            Self::Lt(_, bound) => compare(actual, bound) == Some(Ordering::Less),
            Self::In(_, values) => values.contains(actual),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Filters, ordering and limit for [`Persistence::query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// All must match
    pub filters: Vec<Condition>,
    /// Ascending sort column
    pub order_by: Option<String>,
    /// Maximum rows returned
    pub limit: Option<usize>,
}

impl Query {
    /// Match every row.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a filter.
    #[must_use]
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    /// Sort ascending by `column`.
    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    /// Return at most `limit` rows.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One write inside [`Persistence::run_in_transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a new row
    Insert {
        /// Target table
        table: String,
        /// Row to insert
        row: Row,
    },
    /// Set the given columns on matching rows
    Update {
        /// Target table
        table: String,
        /// Columns to set
        row: Row,
        /// Rows to touch
        filters: Vec<Condition>,
    },
    /// Delete matching rows
    Delete {
        /// Target table
        table: String,
        /// Rows to delete; empty deletes everything
        filters: Vec<Condition>,
    },
}

/// Keyed row store the queue persists through.
///
/// Implementations must be safe to call from several workers at once.
pub trait Persistence: Send + Sync {
    /// Insert `row` into `table`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Database` if the write fails.
    fn insert(&self, table: &str, row: &Row) -> Result<(), QueueError>;

    /// Set the columns in `row` on every row matching `filters`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Database` if the write fails.
    fn update(&self, table: &str, row: &Row, filters: &[Condition]) -> Result<usize, QueueError>;

    /// Delete every row matching `filters`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Database` if the write fails.
    fn delete(&self, table: &str, filters: &[Condition]) -> Result<usize, QueueError>;

    /// Read rows.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Database` if the read fails.
    fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>, QueueError>;

    /// Apply all `ops` atomically: either every write lands or none does.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Database` if any write fails; nothing is applied.
    fn run_in_transaction(&self, ops: &[WriteOp]) -> Result<(), QueueError>;
}

type Tables = HashMap<String, Vec<Row>>;

/// In-process [`Persistence`] for tests and embedding.
///
/// Rows are kept in insertion order. No uniqueness is enforced.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
    fail_transactions: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryPersistence {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `run_in_transaction` fail (or succeed again).
    pub fn set_fail_transactions(&self, fail: bool) {
        self.fail_transactions.store(fail, AtomicOrdering::SeqCst);
    }

    /// Make every subsequent `delete` fail (or succeed again).
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, AtomicOrdering::SeqCst);
    }

    /// Number of rows in `table`.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().get(table).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn apply(tables: &mut Tables, op: &WriteOp) -> usize {
        match op {
            WriteOp::Insert { table, row } => {
                tables.entry(table.clone()).or_default().push(row.clone());
                1
            },
            WriteOp::Update { table, row, filters } => {
                let Some(rows) = tables.get_mut(table) else {
                    return 0;
                };
                let mut touched = 0;
                for existing in rows.iter_mut().filter(|r| filters.iter().all(|c| c.matches(r))) {
                    for (column, value) in row {
                        existing.insert(column.clone(), value.clone());
                    }
                    touched += 1;
                }
                touched
            },
            WriteOp::Delete { table, filters } => {
                let Some(rows) = tables.get_mut(table) else {
                    return 0;
                };
                let before = rows.len();
                rows.retain(|r| !filters.iter().all(|c| c.matches(r)));
                before - rows.len()
            },
        }
    }
}

impl Persistence for MemoryPersistence {
    fn insert(&self, table: &str, row: &Row) -> Result<(), QueueError> {
        let op = WriteOp::Insert {
            table: table.to_string(),
            row: row.clone(),
        };
        Self::apply(&mut self.lock(), &op);
        Ok(())
    }

    fn update(&self, table: &str, row: &Row, filters: &[Condition]) -> Result<usize, QueueError> {
        let op = WriteOp::Update {
            table: table.to_string(),
            row: row.clone(),
            filters: filters.to_vec(),
        };
        Ok(Self::apply(&mut self.lock(), &op))
    }

    fn delete(&self, table: &str, filters: &[Condition]) -> Result<usize, QueueError> {
        if self.fail_deletes.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::Database("delete refused".to_string()));
        }
        let op = WriteOp::Delete {
            table: table.to_string(),
            filters: filters.to_vec(),
        };
        Ok(Self::apply(&mut self.lock(), &op))
    }

    fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>, QueueError> {
        let tables = self.lock();
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| query.filters.iter().all(|c| c.matches(r)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        if let Some(column) = &query.order_by {
            rows.sort_by(|a, b| {
                let a = a.get(column).unwrap_or(&Value::Null);
                let b = b.get(column).unwrap_or(&Value::Null);
                compare(a, b).unwrap_or(Ordering::Equal)
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn run_in_transaction(&self, ops: &[WriteOp]) -> Result<(), QueueError> {
        if self.fail_transactions.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::Database("transaction aborted".to_string()));
        }
        let mut tables = self.lock();
        let mut staged = tables.clone();
        for op in ops {
            Self::apply(&mut staged, op);
        }
        *tables = staged;
        Ok(())
    }
}
