use crate::cli::args::{ListArgs, OutputFormat};
use crate::error::QueueError;
use crate::output::{format_operations, format_status, StatusReport};
use crate::queue::OperationStatus;

use super::Context;

/// Execute status command
///
/// # Errors
///
/// Returns an error if the counts cannot be read or output formatting fails.
pub fn status(ctx: &Context, format: OutputFormat) -> Result<String, QueueError> {
    let counts = ctx.store.counts()?;
    let waiting = [OperationStatus::Pending, OperationStatus::Error, OperationStatus::Processing]
        .iter()
        .filter_map(|s| counts.get(s.as_str()))
        .sum();

    let report = StatusReport {
        database: ctx.paths.database.display().to_string(),
        counts,
        waiting,
        max_queue_size: ctx.config.queue.max_queue_size,
        handlers: ctx.config.handlers.len(),
    };
    format_status(&report, format)
}

/// Execute list command
///
/// # Errors
///
/// Returns an error if the rows cannot be read or output formatting fails.
pub fn list(ctx: &Context, args: &ListArgs, format: OutputFormat) -> Result<String, QueueError> {
    let ops = ctx.store.list_by_status(args.status, Some(args.limit))?;
    let title = args
        .status
        .map_or_else(|| "Operations".to_string(), |s| format!("Operations ({s})"));
    format_operations(&ops, &title, format)
}

/// Execute dlq list command
///
/// # Errors
///
/// Returns an error if the rows cannot be read or output formatting fails.
pub fn dlq_list(ctx: &Context, format: OutputFormat) -> Result<String, QueueError> {
    let ops = ctx.store.load_dead_letters()?;
    format_operations(&ops, "Dead-letter queue", format)
}
