use chrono::Utc;
use serde_json::{json, Value};

use crate::cli::args::{EnqueueArgs, OutputFormat};
use crate::error::QueueError;
use crate::output::{format_enqueued, format_message};
use crate::queue::{EnqueueOptions, Operation, Payload};

use super::Context;

/// Generate an operation ID from the clock and a random suffix.
fn generate_id() -> String {
    format!("{:x}-{:08x}", Utc::now().timestamp_micros(), rand::random::<u32>())
}

fn parse_payload(raw: &str) -> Result<Payload, QueueError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(QueueError::InvalidOperation("payload must be a JSON object".to_string())),
        Err(e) => Err(QueueError::Parse(format!("Invalid payload: {e}"))),
    }
}

/// Execute enqueue command
///
/// # Errors
///
/// Returns an error if the payload is invalid, the queue rejects the
/// operation or output formatting fails.
pub async fn enqueue(ctx: &Context, args: EnqueueArgs, format: OutputFormat) -> Result<String, QueueError> {
    let payload = parse_payload(&args.payload)?;
    let id = args.id.unwrap_or_else(generate_id);
    let op = Operation::new(id, args.module, args.action, payload).with_priority(args.priority);

    let manager = ctx.loaded_manager()?;
    let outcome = manager
        .enqueue_with(
            op.clone(),
            EnqueueOptions {
                skip_deduplication: args.skip_dedup,
            },
        )
        .await;
    // Persists the dedup index for the next invocation.
    manager.shutdown().await;

    format_enqueued(&op, outcome?, format)
}

/// Execute dequeue command
///
/// # Errors
///
/// Returns `QueueError::NotFound` if the operation is not waiting.
pub async fn dequeue(ctx: &Context, id: &str, format: OutputFormat) -> Result<String, QueueError> {
    let manager = ctx.loaded_manager()?;
    let removed = manager.dequeue(id);
    manager.shutdown().await;

    if !removed? {
        return Err(QueueError::NotFound(format!("waiting operation {id}")));
    }
    format_message(
        &format!("Cancelled {id}"),
        &json!({ "id": id, "dequeued": true }),
        format,
    )
}

/// Execute clear command
///
/// # Errors
///
/// Returns `QueueError::InvalidOperation` without `--force`, or an error if
/// the rows cannot be deleted.
pub async fn clear(ctx: &Context, force: bool, format: OutputFormat) -> Result<String, QueueError> {
    if !force {
        return Err(QueueError::InvalidOperation(
            "clear discards every waiting operation; pass --force to confirm".to_string(),
        ));
    }

    let manager = ctx.loaded_manager()?;
    let cleared = manager.clear();
    manager.shutdown().await;
    let cleared = cleared?;

    format_message(
        &format!("Cleared {cleared} operations"),
        &json!({ "cleared": cleared }),
        format,
    )
}

/// Execute dlq retry command
///
/// # Errors
///
/// Returns `QueueError::NotFound` if the operation is not dead-lettered.
pub async fn dlq_retry(ctx: &Context, id: &str, format: OutputFormat) -> Result<String, QueueError> {
    let manager = ctx.loaded_manager()?;
    let result = manager.retry_from_dlq(id);
    manager.shutdown().await;
    result?;

    format_message(
        &format!("Re-queued {id}"),
        &json!({ "id": id, "requeued": true }),
        format,
    )
}

/// Execute purge command
///
/// # Errors
///
/// Returns an error if the rows cannot be deleted.
pub fn purge(ctx: &Context, format: OutputFormat) -> Result<String, QueueError> {
    let manager = ctx.manager(crate::queue::ExecutorRegistry::new())?;
    let purged = manager.purge_processed()?;

    format_message(
        &format!("Purged {purged} processed operations"),
        &json!({ "purged": purged }),
        format,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload() {
        let payload = parse_payload(r#"{"title":"Psalm 23"}"#).unwrap();
        assert_eq!(payload["title"], "Psalm 23");

        assert!(matches!(parse_payload("[1]"), Err(QueueError::InvalidOperation(_))));
        assert!(matches!(parse_payload("{"), Err(QueueError::Parse(_))));
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(generate_id(), generate_id());
    }
}
