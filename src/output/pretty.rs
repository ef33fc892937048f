use std::fmt::Write as _;

use colored::{ColoredString, Colorize};

use super::StatusReport;
use crate::queue::{EnqueueOutcome, MetricsSnapshot, Operation, OperationStatus, Priority};

fn status_icon(status: OperationStatus) -> ColoredString {
    match status {
        OperationStatus::Pending => "[ ]".white(),
        OperationStatus::Processing => "[~]".cyan(),
        OperationStatus::Processed => "[x]".green(),
        OperationStatus::Error => "[!]".yellow(),
        OperationStatus::DeadLetter => "[D]".red(),
        OperationStatus::Cancelled => "[-]".dimmed(),
    }
}

fn priority_label(priority: Priority) -> ColoredString {
    match priority {
        Priority::Low => priority.as_str().dimmed(),
        Priority::Normal => priority.as_str().normal(),
        Priority::High => priority.as_str().yellow(),
        Priority::Critical => priority.as_str().red().bold(),
    }
}

/// Format a list of operations as a pretty table
#[must_use]
pub fn format_operations_pretty(ops: &[Operation], title: &str) -> String {
    if ops.is_empty() {
        return format!("{title} (0 items)\n  No items");
    }

    let mut output = format!("{title} ({} items)\n", ops.len());
    output.push_str(&"─".repeat(60));
    output.push('\n');

    for op in ops {
        let mut line = format!(
            "{} {}  {}.{}  {}",
            status_icon(op.status),
            op.id.bold(),
            op.module,
            op.action,
            priority_label(op.priority)
        );

        if op.retry_count > 0 {
            let _ = write!(line, "  {}", format!("retries: {}", op.retry_count).yellow());
        }

        if let Some(error) = &op.error_message {
            let _ = write!(line, "  {}", error.dimmed());
        }

        output.push_str(&line);
        output.push('\n');
    }

    output
}

/// Format a single operation as pretty output
#[must_use]
pub fn format_operation_pretty(op: &Operation) -> String {
    let mut output = format!("{} {}\n", status_icon(op.status), op.id.bold());
    let _ = writeln!(output, "  {}: {}.{}", "Handler".dimmed(), op.module, op.action);
    let _ = writeln!(output, "  {}: {}", "Status".dimmed(), op.status);
    let _ = writeln!(output, "  {}: {}", "Priority".dimmed(), priority_label(op.priority));
    let _ = writeln!(output, "  {}: {}", "Retries".dimmed(), op.retry_count);
    let _ = writeln!(output, "  {}: {}", "Created".dimmed(), op.created_at.to_rfc3339());

    if let Some(at) = op.next_attempt_at {
        let _ = writeln!(output, "  {}: {}", "Next attempt".dimmed(), at.to_rfc3339());
    }
    if let Some(at) = op.processed_at {
        let _ = writeln!(output, "  {}: {}", "Processed".dimmed(), at.to_rfc3339());
    }
    if let Some(error) = &op.error_message {
        let _ = writeln!(output, "  {}: {}", "Error".dimmed(), error.red());
    }
    if !op.payload.is_empty() {
        let payload = serde_json::Value::Object(op.payload.clone());
        let _ = writeln!(output, "  {}: {payload}", "Payload".dimmed());
    }

    output
}

/// Format the result of an enqueue
#[must_use]
pub fn format_enqueued_pretty(op: &Operation, outcome: EnqueueOutcome) -> String {
    match outcome {
        EnqueueOutcome::Enqueued => format!(
            "{} {}\n{}",
            "Enqueued".green(),
            op.id.bold(),
            format_operation_pretty(op)
        ),
        EnqueueOutcome::Duplicate => format!(
            "{} identical {}.{} operation already enqueued",
            "Skipped:".yellow(),
            op.module,
            op.action
        ),
    }
}

/// Format the status report
#[must_use]
pub fn format_status_pretty(report: &StatusReport) -> String {
    let mut output = format!("{}\n", "Queue status".bold());
    output.push_str(&"─".repeat(40));
    output.push('\n');

    let _ = writeln!(
        output,
        "  {}: {}/{}",
        "Waiting".dimmed(),
        report.waiting.to_string().bold(),
        report.max_queue_size
    );
    for (status, count) in &report.counts {
        let _ = writeln!(output, "  {status:<12} {count}");
    }
    if report.counts.is_empty() {
        let _ = writeln!(output, "  {}", "No operations".dimmed());
    }

    let _ = writeln!(output, "  {}: {}", "Handlers".dimmed(), report.handlers);
    let _ = write!(output, "  {}: {}", "Database".dimmed(), report.database);
    output
}

/// Format the summary of a `run`
#[must_use]
pub fn format_run_summary_pretty(
    metrics: &MetricsSnapshot,
    remaining: usize,
    dead_letters: usize,
) -> String {
    let mut output = format!("{}\n", "Run complete".bold());
    output.push_str(&"─".repeat(40));
    output.push('\n');

    let _ = writeln!(output, "  {}: {}", "Processed".dimmed(), metrics.processed.to_string().green());
    let _ = writeln!(output, "  {}: {}", "Failed attempts".dimmed(), metrics.failed);
    let _ = writeln!(output, "  {}: {}", "Retried".dimmed(), metrics.retried);
    let _ = writeln!(output, "  {}: {}", "Dead-lettered".dimmed(), metrics.moved_to_dlq.to_string().red());
    if metrics.processed > 0 {
        let _ = writeln!(
            output,
            "  {}: {:.1} ms",
            "Average time".dimmed(),
            metrics.average_processing_time_ms
        );
    }
    let _ = writeln!(output, "  {}: {remaining}", "Remaining".dimmed());
    let _ = write!(output, "  {}: {dead_letters}", "Dead-letter queue".dimmed());
    output
}

/// Format a one-line confirmation
#[must_use]
pub fn format_message_pretty(message: &str) -> String {
    message.to_string()
}
