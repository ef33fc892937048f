//! Output formatting for opqueue.
//!
//! This module provides formatters for displaying queue state in various formats.

mod json;
mod pretty;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cli::args::OutputFormat;
use crate::error::QueueError;
use crate::queue::{EnqueueOutcome, MetricsSnapshot, Operation};

pub use json::*;
pub use pretty::*;

/// Summary printed by `opqueue status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Database file
    pub database: String,
    /// Persisted operations per status
    pub counts: BTreeMap<String, usize>,
    /// Operations waiting to run (pending or error)
    pub waiting: usize,
    /// Configured capacity
    pub max_queue_size: usize,
    /// Configured shell handlers
    pub handlers: usize,
}

/// Format the status report based on output format
///
/// # Errors
///
/// Returns `QueueError::Parse` if JSON serialization fails.
pub fn format_status(report: &StatusReport, format: OutputFormat) -> Result<String, QueueError> {
    match format {
        OutputFormat::Pretty => Ok(format_status_pretty(report)),
        OutputFormat::Json => format_status_json(report),
    }
}

/// Format operations based on output format
///
/// # Errors
///
/// Returns `QueueError::Parse` if JSON serialization fails.
pub fn format_operations(
    ops: &[Operation],
    title: &str,
    format: OutputFormat,
) -> Result<String, QueueError> {
    match format {
        OutputFormat::Pretty => Ok(format_operations_pretty(ops, title)),
        OutputFormat::Json => format_operations_json(ops, title),
    }
}

/// Format the result of an enqueue based on output format
///
/// # Errors
///
/// Returns `QueueError::Parse` if JSON serialization fails.
pub fn format_enqueued(
    op: &Operation,
    outcome: EnqueueOutcome,
    format: OutputFormat,
) -> Result<String, QueueError> {
    match format {
        OutputFormat::Pretty => Ok(format_enqueued_pretty(op, outcome)),
        OutputFormat::Json => format_enqueued_json(op, outcome),
    }
}

/// Format the summary of a `run` based on output format
///
/// # Errors
///
/// Returns `QueueError::Parse` if JSON serialization fails.
pub fn format_run_summary(
    metrics: &MetricsSnapshot,
    remaining: usize,
    dead_letters: usize,
    format: OutputFormat,
) -> Result<String, QueueError> {
    match format {
        OutputFormat::Pretty => Ok(format_run_summary_pretty(metrics, remaining, dead_letters)),
        OutputFormat::Json => format_run_summary_json(metrics, remaining, dead_letters),
    }
}

/// Format a one-line confirmation; JSON output carries `data` instead.
///
/// # Errors
///
/// Returns `QueueError::Parse` if JSON serialization fails.
pub fn format_message(
    message: &str,
    data: &serde_json::Value,
    format: OutputFormat,
) -> Result<String, QueueError> {
    match format {
        OutputFormat::Pretty => Ok(format_message_pretty(message)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
    }
}
