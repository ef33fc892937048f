//! Worker pool and the per-attempt processing path.
//!
//! Each worker pops the highest-priority ready operation whose module is
//! not gated by its circuit breaker or rate limiter, then runs the handler.
//! Operations of gated modules keep their place and are skipped, so one
//! failing module does not hold up the others. Batched modules take their
//! rate-limit tokens when the batch flushes.
//! Failures either schedule a delayed retry or move the operation to the
//! dead-letter store.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use super::batch::mark_processed;
use super::events::QueueEvent;
use super::manager::Inner;
use super::operation::{Operation, OperationStatus};
use crate::error::QueueError;

/// Longest a worker sleeps before re-checking for work.
const IDLE_POLL: Duration = Duration::from_secs(1);

// Upper bound for a scheduled retry, so `Instant` arithmetic cannot overflow.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Worker loop; returns when the manager is cancelled.
pub(super) async fn run(inner: Arc<Inner>, worker: usize) {
    debug!(worker, "Worker started");
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        if inner.paused.load(Ordering::SeqCst) {
            if !inner.wait_for_work(IDLE_POLL).await {
                break;
            }
            continue;
        }

        let next = inner.next_ready();
        if let Some(op) = next {
            inner.dispatch(op).await;
        } else {
            inner.report_idle_if_drained();
            let wait = {
                let state = inner.lock_state();
                if state.queue.ready_len() > 0 {
                    // Everything ready belongs to a gated module.
                    inner.config.backoff()
                } else {
                    state
                        .queue
                        .next_release_in(Instant::now())
                        .map_or(IDLE_POLL, |d| d.min(IDLE_POLL))
                }
            };
            if !inner.wait_for_work(wait).await {
                break;
            }
        }
    }
    debug!(worker, "Worker stopped");
}

impl Inner {
    /// Sleep until notified or `timeout` elapses. Returns `false` on cancellation.
    async fn wait_for_work(&self, timeout: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = self.work.notified() => true,
            () = tokio::time::sleep(timeout) => true,
        }
    }

    async fn back_off(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {},
            () = tokio::time::sleep(self.config.backoff()) => {},
        }
    }

    /// Whether `module` cannot be dispatched right now.
    fn is_gated(&self, module: &str) -> bool {
        if !self.breakers.would_admit(module) {
            return true;
        }
        !self.config.is_batched(module) && !self.limiters.has_capacity(module)
    }

    /// Pop the next ready operation of an ungated module and mark it in flight.
    fn next_ready(&self) -> Option<Operation> {
        let mut gated: HashMap<String, bool> = HashMap::new();
        let mut state = self.lock_state();
        let op = state.queue.pop_where(Instant::now(), |op| {
            !*gated
                .entry(op.module.clone())
                .or_insert_with(|| self.is_gated(&op.module))
        })?;
        self.lock_in_flight().insert(op.id.clone(), op.clone());
        Some(op)
    }

    fn requeue_front(&self, op: Operation) {
        let mut state = self.lock_state();
        self.lock_in_flight().remove(&op.id);
        state.queue.push_front(op);
    }

    /// Wait for a rate-limit token for `module`.
    pub(super) async fn acquire_token(&self, module: &str) {
        while !self.limiters.try_acquire(module) {
            tokio::time::sleep(self.config.backoff()).await;
        }
    }

    /// Run one attempt for `op`.
    ///
    /// The gates are checked again here since another worker may have
    /// claimed the trial slot or the last token after the pop.
    async fn dispatch(&self, mut op: Operation) {
        let batched = self.config.is_batched(&op.module);
        if !self.breakers.can_execute(&op.module) {
            debug!(id = %op.id, module = %op.module, "Circuit open, requeueing");
            self.requeue_front(op);
            self.back_off().await;
            return;
        }
        if !batched && !self.limiters.try_acquire(&op.module) {
            debug!(id = %op.id, module = %op.module, "Rate limited, requeueing");
            self.breakers.cancel_trial(&op.module);
            self.requeue_front(op);
            self.back_off().await;
            return;
        }

        if let Err(e) = op.transition(OperationStatus::Processing) {
            self.breakers.cancel_trial(&op.module);
            self.observability
                .capture_exception(&e, &Self::context(&op));
            warn!(id = %op.id, error = %e, "Refusing to dispatch operation");
            op.error_message = Some(e.to_string());
            op.status = OperationStatus::Error;
            self.dead_letter(op);
            return;
        }
        self.lock_in_flight().insert(op.id.clone(), op.clone());
        self.persist(&op);

        if batched {
            let full = self.lock_batches().push(op);
            if let Some(batch) = full {
                self.flush_batch(batch).await;
            }
            return;
        }

        match self.run_handler(&op).await {
            Ok(elapsed) => self.complete_success(op, elapsed),
            Err(e) => self.complete_failure(op, e),
        }
    }

    /// Resolve and run the handler for `op`. Returns the execution time.
    ///
    /// The handler runs on its own task so a panic fails the operation
    /// instead of killing the worker.
    pub(super) async fn run_handler(&self, op: &Operation) -> Result<Duration, QueueError> {
        self.emit(QueueEvent::Processing {
            size: self.size(),
            operation: op.clone(),
        });

        let handler = self.registry.resolve(&op.module, &op.action)?;
        let span = self
            .observability
            .start_span(&format!("{}.{}", op.module, op.action));
        let payload = op.payload.clone();
        let started = Instant::now();

        let task = tokio::spawn(async move { handler.execute(&payload).await }.instrument(span));
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(QueueError::Execution(format!("handler panicked: {e}"))),
        };
        result.map(|()| started.elapsed())
    }

    /// Mark `op` processed, persist it and record the success.
    pub(super) fn complete_success(&self, mut op: Operation, elapsed: Duration) {
        if let Err(e) = mark_processed(&mut op, Utc::now()) {
            warn!(id = %op.id, error = %e, "Cannot mark operation processed");
            self.observability
                .capture_exception(&e, &Self::context(&op));
            self.lock_in_flight().remove(&op.id);
            return;
        }
        self.persist(&op);
        self.finish_success(op, elapsed);
    }

    /// Bookkeeping for an operation already persisted as processed.
    pub(super) fn finish_success(&self, op: Operation, elapsed: Duration) {
        self.lock_in_flight().remove(&op.id);
        self.breakers.record_success(&op.module);
        self.metrics.record_processed(elapsed);
        info!(
            id = %op.id,
            module = %op.module,
            action = %op.action,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Operation processed"
        );
        self.emit(QueueEvent::Processed {
            size: self.size(),
            operation: op,
        });
        self.report_idle_if_drained();
    }

    /// Record a failed attempt against the breaker, then retry or dead-letter.
    ///
    /// Throttling reported by the handler defers the operation instead.
    pub(super) fn complete_failure(&self, op: Operation, err: QueueError) {
        if err.is_transient() {
            self.breakers.cancel_trial(&op.module);
            self.defer(op, &err);
            return;
        }
        if matches!(err, QueueError::UnsupportedOperation { .. }) {
            self.breakers.cancel_trial(&op.module);
        } else {
            self.breakers.record_failure(&op.module);
        }
        self.handle_failure(op, err);
    }

    /// Put `op` back after the backoff without spending retry budget.
    fn defer(&self, mut op: Operation, reason: &QueueError) {
        if let Err(e) = op.transition(OperationStatus::Pending) {
            warn!(id = %op.id, error = %e, "Unexpected status on deferral");
            op.status = OperationStatus::Pending;
        }
        self.persist(&op);
        debug!(id = %op.id, module = %op.module, reason = %reason, "Deferring operation");

        let mut state = self.lock_state();
        state
            .queue
            .schedule(op.clone(), Instant::now() + self.config.backoff());
        self.lock_in_flight().remove(&op.id);
    }

    fn handle_failure(&self, mut op: Operation, err: QueueError) {
        self.metrics.record_failed();
        op.error_message = Some(err.to_string());
        if let Err(e) = op.transition(OperationStatus::Error) {
            warn!(id = %op.id, error = %e, "Unexpected status on failure");
            op.status = OperationStatus::Error;
        }
        self.observability
            .capture_exception(&err, &Self::context(&op));

        let attempt = op.retry_count;
        if err.is_permanent() || !self.retry.has_budget(attempt) {
            self.dead_letter(op);
        } else {
            self.schedule_retry(op, attempt);
        }
        self.report_idle_if_drained();
    }

    fn schedule_retry(&self, mut op: Operation, attempt: u32) {
        let delay = self.retry.delay(attempt).min(MAX_RETRY_DELAY);
        op.retry_count = op.retry_count.saturating_add(1);
        if op.retry_count > 2 {
            let promoted = op.priority.promote();
            if promoted != op.priority {
                debug!(id = %op.id, from = %op.priority, to = %promoted, "Promoting retried operation");
            }
            op.priority = promoted;
        }
        if let Err(e) = op.transition(OperationStatus::Pending) {
            warn!(id = %op.id, error = %e, "Unexpected status on retry");
            op.status = OperationStatus::Pending;
        }
        op.next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self.persist(&op);

        let size = {
            let mut state = self.lock_state();
            state.queue.schedule(op.clone(), Instant::now() + delay);
            self.lock_in_flight().remove(&op.id);
            state.queue.len()
        };
        self.metrics.record_retried();
        info!(
            id = %op.id,
            module = %op.module,
            retry_count = op.retry_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Operation scheduled for retry"
        );
        self.emit(QueueEvent::Failed { size, operation: op });
        self.work.notify_one();
    }

    fn dead_letter(&self, mut op: Operation) {
        if let Err(e) = op.transition(OperationStatus::DeadLetter) {
            warn!(id = %op.id, error = %e, "Unexpected status on dead-letter");
            op.status = OperationStatus::DeadLetter;
        }
        op.next_attempt_at = None;
        self.persist(&op);

        self.lock_dead_letters().insert(op.clone());
        self.lock_in_flight().remove(&op.id);
        self.metrics.record_dead_lettered();
        warn!(
            id = %op.id,
            module = %op.module,
            action = %op.action,
            retry_count = op.retry_count,
            error = op.error_message.as_deref().unwrap_or(""),
            "Operation moved to dead-letter queue"
        );
        self.emit(QueueEvent::Failed {
            size: self.size(),
            operation: op,
        });
    }
}
