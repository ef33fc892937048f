//! JSON output formatting for opqueue.

use serde_json::json;

use super::StatusReport;
use crate::error::QueueError;
use crate::queue::{EnqueueOutcome, MetricsSnapshot, Operation};

/// Format the status report as JSON
///
/// # Errors
///
/// Returns `QueueError::Parse` if JSON serialization fails.
pub fn format_status_json(report: &StatusReport) -> Result<String, QueueError> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Format operations as JSON
///
/// # Errors
///
/// Returns `QueueError::Parse` if JSON serialization fails.
pub fn format_operations_json(ops: &[Operation], title: &str) -> Result<String, QueueError> {
    let output = json!({
        "list": title,
        "count": ops.len(),
        "items": ops
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format an enqueue result as JSON
///
/// # Errors
///
/// Returns `QueueError::Parse` if JSON serialization fails.
pub fn format_enqueued_json(op: &Operation, outcome: EnqueueOutcome) -> Result<String, QueueError> {
    let output = json!({
        "id": op.id,
        "enqueued": outcome == EnqueueOutcome::Enqueued,
        "duplicate": outcome == EnqueueOutcome::Duplicate,
        "operation": op
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format a run summary as JSON
///
/// # Errors
///
/// Returns `QueueError::Parse` if JSON serialization fails.
pub fn format_run_summary_json(
    metrics: &MetricsSnapshot,
    remaining: usize,
    dead_letters: usize,
) -> Result<String, QueueError> {
    let output = json!({
        "remaining": remaining,
        "dead_letters": dead_letters,
        "metrics": metrics
    });
    Ok(serde_json::to_string_pretty(&output)?)
}
