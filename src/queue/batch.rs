//! Batch buffering and flushing.
//!
//! Operations of allow-listed modules are held in per-module buffers after
//! passing the breaker gate. A buffer flushes when it reaches `batch_size`
//! or when the flush timer fires. Each handler takes its rate-limit token
//! right before it runs. All handlers of a batch run first; if every one succeeds the status updates are committed
//! in one transaction. A failed commit or any failed handler degrades to the
//! per-operation success/failure path.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use super::manager::Inner;
use super::operation::Operation;
use crate::error::QueueError;

/// Per-module buffers of operations waiting for a batch flush.
#[derive(Debug)]
pub struct BatchBuffers {
    batch_size: usize,
    buffers: HashMap<String, Vec<Operation>>,
}

impl BatchBuffers {
    /// Create empty buffers that fill at `batch_size`.
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            buffers: HashMap::new(),
        }
    }

    /// Buffer `op`. Returns the whole module buffer once it is full.
    pub fn push(&mut self, op: Operation) -> Option<Vec<Operation>> {
        let buffer = self.buffers.entry(op.module.clone()).or_default();
        buffer.push(op);
        if buffer.len() >= self.batch_size {
            Some(std::mem::take(buffer))
        } else {
            None
        }
    }

    /// Take every non-empty buffer.
    pub fn take_all(&mut self) -> Vec<Vec<Operation>> {
        let mut modules: Vec<String> = self.buffers.keys().cloned().collect();
        modules.sort();
        modules
            .into_iter()
            .filter_map(|module| self.buffers.remove(&module))
            .filter(|ops| !ops.is_empty())
            .collect()
    }

    /// Look up a buffered operation.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.buffers.values().flatten().find(|op| op.id == id)
    }

    /// Number of buffered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    /// Flush every buffer. Returns how many operations were flushed.
    pub(super) async fn flush_all_batches(&self) -> usize {
        let batches = self.lock_batches().take_all();
        let mut flushed = 0;
        for batch in batches {
            flushed += batch.len();
            self.flush_batch(batch).await;
        }
        flushed
    }

    /// Execute one module's buffered operations.
    pub(super) async fn flush_batch(&self, batch: Vec<Operation>) {
        if batch.is_empty() {
            return;
        }
        self.metrics.record_batch();
        debug!(module = %batch[0].module, size = batch.len(), "Flushing batch");

        let mut outcomes: Vec<(Operation, Result<Duration, QueueError>)> =
            Vec::with_capacity(batch.len());
        for op in batch {
            self.acquire_token(&op.module).await;
            let result = self.run_handler(&op).await;
            outcomes.push((op, result));
        }

        if outcomes.iter().all(|(_, result)| result.is_ok()) {
            let mut committed: Vec<Operation> = outcomes
                .iter()
                .map(|(op, _)| op.clone())
                .collect();
            let now = chrono::Utc::now();
            let mut transitions_ok = true;
            for op in &mut committed {
                transitions_ok &= mark_processed(op, now).is_ok();
            }

            let commit = if transitions_ok {
                self.store.commit_batch(&committed)
            } else {
                Err(QueueError::Database("invalid batch state".to_string()))
            };
            match commit {
                Ok(()) => {
                    for (op, (_, result)) in committed.into_iter().zip(outcomes) {
                        let elapsed = result.unwrap_or_default();
                        self.finish_success(op, elapsed);
                    }
                    return;
                },
                Err(e) => {
                    warn!(error = %e, "Batch commit failed, falling back to per-operation handling");
                },
            }
        }

        for (op, result) in outcomes {
            match result {
                Ok(elapsed) => self.complete_success(op, elapsed),
                Err(e) => self.complete_failure(op, e),
            }
        }
    }
}

/// Move `op` to processed at `now`.
pub(super) fn mark_processed(
    op: &mut Operation,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), QueueError> {
    op.transition(super::operation::OperationStatus::Processed)?;
    op.processed_at = Some(now);
    op.error_message = None;
    op.next_attempt_at = None;
    Ok(())
}
