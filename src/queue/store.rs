//! Operation persistence on top of the [`Persistence`] contract.
//!
//! Maps [`Operation`] values to rows of the `operation_queue` table and the
//! deduplication index to rows of `dedup_hashes`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use super::dedup::DedupEntry;
use super::operation::{Operation, OperationStatus, Payload};
use crate::error::QueueError;
use crate::storage::{Condition, Persistence, Query, Row, WriteOp};

/// Table holding queued operations.
pub const OPERATIONS_TABLE: &str = "operation_queue";

/// Table holding the deduplication index snapshot.
pub const DEDUP_TABLE: &str = "dedup_hashes";

const RECOVERABLE: [OperationStatus; 3] = [
    OperationStatus::Pending,
    OperationStatus::Processing,
    OperationStatus::Error,
];

/// Reads and writes operations through a persistence collaborator.
#[derive(Clone)]
pub struct OperationStore {
    persistence: Arc<dyn Persistence>,
}

impl OperationStore {
    /// Create a store over `persistence`.
    #[must_use]
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Insert a new operation row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn insert(&self, op: &Operation) -> Result<(), QueueError> {
        self.persistence.insert(OPERATIONS_TABLE, &to_row(op))
    }

    /// Update the operation's row, inserting it when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save(&self, op: &Operation) -> Result<(), QueueError> {
        let touched = self
            .persistence
            .update(OPERATIONS_TABLE, &to_row(op), &[by_id(&op.id)])?;
        if touched == 0 {
            self.insert(op)?;
        }
        Ok(())
    }

    /// Delete one operation. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, id: &str) -> Result<bool, QueueError> {
        Ok(self.persistence.delete(OPERATIONS_TABLE, &[by_id(id)])? > 0)
    }

    /// Delete several operations at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_many(&self, ids: &[String]) -> Result<usize, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.persistence
            .delete(OPERATIONS_TABLE, &[Condition::is_in("id", ids.iter().cloned())])
    }

    /// Fetch one operation by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is malformed.
    pub fn get(&self, id: &str) -> Result<Option<Operation>, QueueError> {
        let rows = self
            .persistence
            .query(OPERATIONS_TABLE, &Query::all().filter(by_id(id)).limit(1))?;
        rows.first().map(from_row).transpose()
    }

    /// Operations that must be reloaded after a restart, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub fn load_recoverable(&self) -> Result<Vec<Operation>, QueueError> {
        self.load(
            Query::all()
                .filter(Condition::is_in("status", RECOVERABLE.map(|s| s.as_str())))
                .order_by("created_at"),
        )
    }

    /// Dead-lettered operations, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub fn load_dead_letters(&self) -> Result<Vec<Operation>, QueueError> {
        self.list_by_status(Some(OperationStatus::DeadLetter), None)
    }

    /// Operations with `status` (all when `None`), oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub fn list_by_status(
        &self,
        status: Option<OperationStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Operation>, QueueError> {
        let mut query = Query::all().order_by("created_at");
        if let Some(status) = status {
            query = query.filter(Condition::eq("status", status.as_str()));
        }
        query.limit = limit;
        self.load(query)
    }

    fn load(&self, query: Query) -> Result<Vec<Operation>, QueueError> {
        self.persistence
            .query(OPERATIONS_TABLE, &query)?
            .iter()
            .map(from_row)
            .collect()
    }

    /// Delete processed operations finished before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn purge_processed(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        self.persistence.delete(
            OPERATIONS_TABLE,
            &[
                Condition::eq("status", OperationStatus::Processed.as_str()),
                Condition::lt("processed_at", timestamp(cutoff)),
            ],
        )
    }

    /// Row count per status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn counts(&self) -> Result<BTreeMap<String, usize>, QueueError> {
        let rows = self.persistence.query(OPERATIONS_TABLE, &Query::all())?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let status = row
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            *counts.entry(status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Writes that mark every operation in `ops` processed.
    #[must_use]
    pub fn processed_writes(ops: &[Operation]) -> Vec<WriteOp> {
        ops.iter()
            .map(|op| WriteOp::Update {
                table: OPERATIONS_TABLE.to_string(),
                row: to_row(op),
                filters: vec![by_id(&op.id)],
            })
            .collect()
    }

    /// Persist every operation in `ops` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is written then.
    pub fn commit_batch(&self, ops: &[Operation]) -> Result<(), QueueError> {
        self.persistence
            .run_in_transaction(&Self::processed_writes(ops))
    }

    /// Replace the persisted deduplication index.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn save_dedup(&self, entries: &[DedupEntry]) -> Result<(), QueueError> {
        let mut ops = Vec::with_capacity(entries.len() + 1);
        ops.push(WriteOp::Delete {
            table: DEDUP_TABLE.to_string(),
            filters: Vec::new(),
        });
        for entry in entries {
            ops.push(WriteOp::Insert {
                table: DEDUP_TABLE.to_string(),
                row: object(json!({
                    "hash": entry.hash,
                    "registered_at": timestamp(entry.registered_at),
                    "operation_id": entry.owner,
                })),
            });
        }
        self.persistence.run_in_transaction(&ops)
    }

    /// Load the persisted deduplication index.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub fn load_dedup(&self) -> Result<Vec<DedupEntry>, QueueError> {
        self.persistence
            .query(DEDUP_TABLE, &Query::all())?
            .iter()
            .map(|row| {
                Ok(DedupEntry {
                    hash: text(row, "hash")?,
                    registered_at: parse_time(&text(row, "registered_at")?)?,
                    owner: row.get("operation_id").and_then(Value::as_str).map(String::from),
                })
            })
            .collect()
    }
}

fn by_id(id: &str) -> Condition {
    Condition::eq("id", id)
}

fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// RFC 3339 in UTC with a fixed width, so string order is time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueueError::Parse(format!("Invalid timestamp {s:?}: {e}")))
}

fn text(row: &Row, column: &str) -> Result<String, QueueError> {
    row.get(column)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| QueueError::Parse(format!("Missing column {column}")))
}

fn optional_time(row: &Row, column: &str) -> Result<Option<DateTime<Utc>>, QueueError> {
    row.get(column)
        .and_then(Value::as_str)
        .map(parse_time)
        .transpose()
}

/// Operation as a persisted row.
#[must_use]
pub fn to_row(op: &Operation) -> Row {
    object(json!({
        "id": op.id,
        "module": op.module,
        "action": op.action,
        "payload": Value::Object(op.payload.clone()).to_string(),
        "priority": op.priority.as_str(),
        "retry_count": op.retry_count,
        "status": op.status.as_str(),
        "error_message": op.error_message,
        "created_at": timestamp(op.created_at),
        "processed_at": op.processed_at.map(timestamp),
        "next_attempt_at": op.next_attempt_at.map(timestamp),
    }))
}

/// Operation from a persisted row.
///
/// # Errors
///
/// Returns `QueueError::Parse` if a column is missing or malformed.
pub fn from_row(row: &Row) -> Result<Operation, QueueError> {
    let payload: Payload = serde_json::from_str(&text(row, "payload")?)?;
    let retry_count = row
        .get("retry_count")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);

    Ok(Operation {
        id: text(row, "id")?,
        module: text(row, "module")?,
        action: text(row, "action")?,
        payload,
        priority: text(row, "priority")?.parse()?,
        retry_count,
        status: text(row, "status")?.parse()?,
        error_message: row
            .get("error_message")
            .and_then(Value::as_str)
            .map(String::from),
        created_at: parse_time(&text(row, "created_at")?)?,
        processed_at: optional_time(row, "processed_at")?,
        next_attempt_at: optional_time(row, "next_attempt_at")?,
    })
}
