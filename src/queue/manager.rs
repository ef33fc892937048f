//! Queue orchestrator.
//!
//! [`QueueManager`] owns every piece of shared state (priority tiers, the
//! dead-letter store, breakers, rate limiters, the dedup index, batch
//! buffers and metrics) and hands a shared handle of it to the workers and
//! periodic tasks it spawns. Every state change is mirrored to the
//! persistence collaborator so a restart can rebuild the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batch::BatchBuffers;
use super::circuit_breaker::{CircuitBreakers, CircuitState};
use super::dedup::DeduplicationIndex;
use super::events::QueueEvent;
use super::executor::ExecutorRegistry;
use super::metrics::{MetricsSnapshot, QueueMetrics};
use super::operation::{Operation, OperationStatus, Payload};
use super::priority::{DeadLetterStore, PriorityQueueSet};
use super::rate_limiter::RateLimiters;
use super::retry::RetryPolicy;
use super::store::OperationStore;
use super::worker;
use crate::config::{BackpressureStrategy, QueueConfig};
use crate::error::QueueError;
use crate::storage::Persistence;
use crate::telemetry::Observability;

const EVENT_CAPACITY: usize = 256;

/// Per-call enqueue options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Accept the operation even if an identical one was seen recently.
    pub skip_deduplication: bool,
}

/// What `enqueue` did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Persisted and queued
    Enqueued,
    /// Dropped as a duplicate; nothing was persisted
    Duplicate,
}

/// Waiting operations plus admissions that passed backpressure but are not
/// queued yet.
#[derive(Debug, Default)]
pub(super) struct QueueState {
    pub(super) queue: PriorityQueueSet,
    pub(super) reserved: usize,
}

/// State shared between the manager, its workers and its timers.
pub(crate) struct Inner {
    pub(super) config: QueueConfig,
    pub(super) retry: RetryPolicy,
    pub(super) registry: ExecutorRegistry,
    pub(super) store: OperationStore,
    pub(super) observability: Arc<dyn Observability>,
    pub(super) state: Mutex<QueueState>,
    pub(super) in_flight: Mutex<HashMap<String, Operation>>,
    pub(super) dead_letters: Mutex<DeadLetterStore>,
    pub(super) dedup: Mutex<DeduplicationIndex>,
    pub(super) batches: Mutex<BatchBuffers>,
    pub(super) breakers: CircuitBreakers,
    pub(super) limiters: RateLimiters,
    pub(super) metrics: QueueMetrics,
    pub(super) events: broadcast::Sender<QueueEvent>,
    pub(super) paused: AtomicBool,
    pub(super) idle_reported: AtomicBool,
    pub(super) recovered: AtomicBool,
    pub(super) work: Notify,
    pub(super) cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    pub(super) fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }

    pub(super) fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, Operation>> {
        lock(&self.in_flight)
    }

    pub(super) fn lock_dead_letters(&self) -> MutexGuard<'_, DeadLetterStore> {
        lock(&self.dead_letters)
    }

    pub(super) fn lock_dedup(&self) -> MutexGuard<'_, DeduplicationIndex> {
        lock(&self.dedup)
    }

    pub(super) fn lock_batches(&self) -> MutexGuard<'_, BatchBuffers> {
        lock(&self.batches)
    }

    /// Operations waiting in the tiers, delayed retries included.
    pub(super) fn size(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub(super) fn emit(&self, event: QueueEvent) {
        debug!(event = event.name(), size = event.size(), "Queue event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Context attached to observability reports about `op`.
    pub(super) fn context(op: &Operation) -> Payload {
        match json!({
            "operation_id": op.id,
            "module": op.module,
            "action": op.action,
            "priority": op.priority.as_str(),
            "retry_count": op.retry_count,
        }) {
            serde_json::Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    /// Persist `op`. Failures are logged and reported, not returned.
    pub(super) fn persist(&self, op: &Operation) {
        if let Err(e) = self.store.save(op) {
            warn!(id = %op.id, status = %op.status, error = %e, "Failed to persist operation");
            self.observability.capture_exception(&e, &Self::context(op));
        }
    }

    /// Whether nothing is queued, buffered or executing.
    pub(super) fn is_drained(&self) -> bool {
        let state = self.lock_state();
        state.queue.is_empty() && state.reserved == 0 && self.lock_in_flight().is_empty()
    }

    /// Emit `Idle` once per transition into the drained state.
    pub(super) fn report_idle_if_drained(&self) {
        if self.is_drained() && !self.idle_reported.swap(true, Ordering::SeqCst) {
            self.emit(QueueEvent::Idle { size: 0 });
        }
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.lock_state();
        if state.queue.len() + state.reserved >= self.config.max_queue_size {
            return false;
        }
        state.reserved += 1;
        true
    }

    fn release_reservation(&self) {
        let mut state = self.lock_state();
        state.reserved = state.reserved.saturating_sub(1);
    }

    /// Put back an operation taken out of the tiers, honouring its retry time.
    fn reinstate(&self, op: Operation) {
        let delay = op
            .next_attempt_at
            .and_then(|at| (at - Utc::now()).to_std().ok());
        let mut state = self.lock_state();
        match delay {
            Some(delay) => state.queue.schedule(op, Instant::now() + delay),
            None => state.queue.push_front(op),
        }
    }

    /// Apply the backpressure policy until a slot is reserved.
    async fn admit(&self) -> Result<(), QueueError> {
        if self.try_reserve() {
            return Ok(());
        }
        let max = self.config.max_queue_size;

        match self.config.backpressure_strategy {
            BackpressureStrategy::Reject => Err(QueueError::QueueFull { max }),
            BackpressureStrategy::DropOldest => {
                let victim = self.lock_state().queue.drop_oldest();
                if let Some(victim) = victim {
                    if let Err(e) = self.store.delete(&victim.id) {
                        self.reinstate(victim);
                        return Err(e);
                    }
                    self.lock_dedup().forget_operation(&victim);
                    self.metrics.record_dropped();
                    warn!(id = %victim.id, module = %victim.module, "Dropped oldest operation, queue full");
                }
                if self.try_reserve() {
                    Ok(())
                } else {
                    Err(QueueError::QueueFull { max })
                }
            },
            BackpressureStrategy::Block => {
                debug!(max, "Queue full, waiting for space");
                loop {
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(QueueError::ShuttingDown),
                        () = tokio::time::sleep(self.config.block_poll()) => {},
                    }
                    if self.try_reserve() {
                        return Ok(());
                    }
                }
            },
        }
    }

    /// Validate, deduplicate, apply backpressure, persist and queue.
    async fn enqueue(&self, op: Operation, options: EnqueueOptions) -> Result<EnqueueOutcome, QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        op.validate()?;
        if op.status != OperationStatus::Pending {
            return Err(QueueError::InvalidOperation(format!(
                "new operations must be pending, got {}",
                op.status
            )));
        }
        if self.find(&op.id).is_some() {
            return Err(QueueError::InvalidOperation(format!(
                "operation {} is already queued",
                op.id
            )));
        }

        let hash = if options.skip_deduplication {
            None
        } else {
            let (hash, duplicate) = self.lock_dedup().check_operation(&op, Utc::now());
            if duplicate {
                self.metrics.record_duplicate();
                debug!(id = %op.id, module = %op.module, action = %op.action, "Duplicate operation dropped");
                return Ok(EnqueueOutcome::Duplicate);
            }
            Some(hash)
        };
        let forget = |inner: &Self| {
            if let Some(hash) = &hash {
                inner.lock_dedup().forget(hash);
            }
        };

        if let Err(e) = self.admit().await {
            forget(self);
            return Err(e);
        }

        if let Err(e) = self.store.insert(&op) {
            self.release_reservation();
            forget(self);
            return Err(e);
        }

        let size = {
            let mut state = self.lock_state();
            state.reserved = state.reserved.saturating_sub(1);
            state.queue.push_back(op.clone());
            state.queue.len()
        };
        self.idle_reported.store(false, Ordering::SeqCst);
        self.metrics.record_enqueued();
        self.observability
            .add_breadcrumb("Operation enqueued", "queue", &Self::context(&op));
        info!(id = %op.id, module = %op.module, action = %op.action, priority = %op.priority, "Operation enqueued");
        self.emit(QueueEvent::Enqueued { size, operation: op });
        self.work.notify_one();

        Ok(EnqueueOutcome::Enqueued)
    }

    /// Find an operation anywhere in memory.
    fn find(&self, id: &str) -> Option<Operation> {
        if let Some(op) = self.lock_state().queue.get(id) {
            return Some(op.clone());
        }
        if let Some(op) = self.lock_in_flight().get(id) {
            return Some(op.clone());
        }
        self.lock_dead_letters().get(id).cloned()
    }

    /// Rebuild in-memory state from persistence, once.
    fn recover(&self) -> Result<usize, QueueError> {
        if self.recovered.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let now = Utc::now();
        let mut recovered = 0;

        for mut op in self.store.load_recoverable()? {
            if self.find(&op.id).is_some() {
                continue;
            }
            if op.status != OperationStatus::Pending {
                // An interrupted attempt is retried from scratch.
                op.transition(OperationStatus::Pending)?;
                self.persist(&op);
            }

            let delay = op
                .next_attempt_at
                .and_then(|at| (at - now).to_std().ok())
                .filter(|d| !d.is_zero());
            let mut state = self.lock_state();
            match delay {
                Some(delay) => state.queue.schedule(op, Instant::now() + delay),
                None => state.queue.push_back(op),
            }
            recovered += 1;
        }

        let dead = self.store.load_dead_letters()?;
        let dead_count = dead.len();
        {
            let mut dlq = self.lock_dead_letters();
            for op in dead {
                dlq.insert(op);
            }
        }

        let hashes = self.store.load_dedup()?;
        {
            let mut dedup = self.lock_dedup();
            dedup.restore(hashes);
            dedup.purge_expired(now);
        }

        self.recovered.store(true, Ordering::SeqCst);
        if recovered > 0 || dead_count > 0 {
            info!(recovered, dead_letters = dead_count, "Recovered operations from storage");
        }
        Ok(recovered)
    }

    /// Persist the dedup index after dropping expired entries.
    pub(super) fn persist_dedup(&self) {
        let snapshot = {
            let mut dedup = self.lock_dedup();
            dedup.purge_expired(Utc::now());
            dedup.snapshot()
        };
        if let Err(e) = self.store.save_dedup(&snapshot) {
            warn!(error = %e, "Failed to persist deduplication index");
        }
    }

    /// Delete processed rows older than the retention window.
    fn purge_processed(&self) -> Result<usize, QueueError> {
        let retention = chrono::Duration::from_std(self.config.processed_retention())
            .map_err(|e| QueueError::Config(format!("Invalid retention: {e}")))?;
        let purged = self.store.purge_processed(Utc::now() - retention)?;
        if purged > 0 {
            info!(purged, "Purged processed operations");
        }
        Ok(purged)
    }
}

/// Which periodic task a timer drives.
#[derive(Debug, Clone, Copy)]
enum Periodic {
    PersistDedup,
    FlushBatches,
    Cleanup,
}

/// Durable, prioritized operation queue with a worker pool.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl QueueManager {
    /// Build a manager. Nothing runs until [`QueueManager::start`].
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Config` if `config` fails validation.
    pub fn new(
        config: QueueConfig,
        registry: ExecutorRegistry,
        persistence: Arc<dyn Persistence>,
        observability: Arc<dyn Observability>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Inner {
            retry: config.retry_policy(),
            registry,
            store: OperationStore::new(persistence),
            observability,
            state: Mutex::new(QueueState::default()),
            in_flight: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(DeadLetterStore::new()),
            dedup: Mutex::new(DeduplicationIndex::new(config.deduplication_window())),
            batches: Mutex::new(BatchBuffers::new(config.batch_size)),
            breakers: CircuitBreakers::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout(),
            ),
            limiters: RateLimiters::new(config.rate_limit),
            metrics: QueueMetrics::new(),
            events,
            paused: AtomicBool::new(false),
            idle_reported: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            work: Notify::new(),
            cancel: CancellationToken::new(),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Load persisted operations, dead letters and dedup hashes without
    /// starting any workers. Returns how many operations were queued.
    ///
    /// [`QueueManager::start`] loads on its own; loading twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read.
    pub fn load(&self) -> Result<usize, QueueError> {
        self.inner.recover()
    }

    /// Recover persisted state, then spawn the workers and periodic tasks.
    ///
    /// Calling `start` on a running manager is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be loaded, or
    /// `QueueError::ShuttingDown` after [`QueueManager::shutdown`].
    pub fn start(&self) -> Result<(), QueueError> {
        if self.inner.cancel.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            return Ok(());
        }

        self.inner.recover()?;

        let config = &self.inner.config;
        for id in 0..config.max_workers {
            tasks.push(tokio::spawn(worker::run(Arc::clone(&self.inner), id)));
        }
        tasks.push(self.spawn_periodic(Periodic::PersistDedup, config.persistence_interval()));
        tasks.push(self.spawn_periodic(Periodic::Cleanup, config.cleanup_interval()));
        if config.enable_batching {
            tasks.push(self.spawn_periodic(Periodic::FlushBatches, config.batch_flush_interval()));
        }

        info!(workers = config.max_workers, size = self.inner.size(), "Queue started");
        Ok(())
    }

    fn spawn_periodic(&self, task: Periodic, period: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                match task {
                    Periodic::PersistDedup => inner.persist_dedup(),
                    Periodic::FlushBatches => {
                        inner.flush_all_batches().await;
                    },
                    Periodic::Cleanup => {
                        if let Err(e) = inner.purge_processed() {
                            warn!(error = %e, "Cleanup of processed operations failed");
                        }
                    },
                }
            }
            debug!(?task, "Periodic task stopped");
        })
    }

    /// Enqueue with default options.
    ///
    /// # Errors
    ///
    /// See [`QueueManager::enqueue_with`].
    pub async fn enqueue(&self, op: Operation) -> Result<EnqueueOutcome, QueueError> {
        self.inner.enqueue(op, EnqueueOptions::default()).await
    }

    /// Validate, deduplicate, apply backpressure, persist and queue `op`.
    ///
    /// # Errors
    ///
    /// - `QueueError::InvalidOperation` for empty fields, a non-pending
    ///   status or an id already in the queue
    /// - `QueueError::QueueFull` when backpressure rejects the operation
    /// - `QueueError::ShuttingDown` after shutdown began
    /// - persistence errors from the initial insert
    pub async fn enqueue_with(
        &self,
        op: Operation,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        self.inner.enqueue(op, options).await
    }

    /// Cancel a waiting operation and delete its row.
    ///
    /// Returns `false` if the operation is not waiting (already processing,
    /// done or unknown).
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be deleted.
    pub fn dequeue(&self, id: &str) -> Result<bool, QueueError> {
        let removed = self.inner.lock_state().queue.remove(id);
        let Some(mut op) = removed else {
            return Ok(false);
        };
        op.transition(OperationStatus::Cancelled)?;
        self.inner.store.delete(id)?;

        self.inner.lock_dedup().forget_operation(&op);
        info!(id, module = %op.module, "Operation cancelled");
        self.inner.report_idle_if_drained();
        Ok(true)
    }

    /// Stop dispatching; queued work is kept and in-flight work finishes.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("Queue paused");
            self.inner.emit(QueueEvent::Paused {
                size: self.inner.size(),
            });
        }
    }

    /// Restart dispatching.
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Queue resumed");
            self.inner.emit(QueueEvent::Resumed {
                size: self.inner.size(),
            });
            self.inner.work.notify_waiters();
        }
    }

    /// Whether dispatch is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Discard every queued and buffered operation and its row, reset the
    /// metrics and the dedup index. Dead letters are kept.
    ///
    /// Returns how many operations were discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be deleted.
    pub fn clear(&self) -> Result<usize, QueueError> {
        let mut ids: Vec<String> = self
            .inner
            .lock_state()
            .queue
            .drain()
            .into_iter()
            .map(|op| op.id)
            .collect();
        let buffered: Vec<String> = self
            .inner
            .lock_batches()
            .take_all()
            .into_iter()
            .flatten()
            .map(|op| op.id)
            .collect();
        {
            let mut in_flight = self.inner.lock_in_flight();
            for id in &buffered {
                in_flight.remove(id);
            }
        }
        ids.extend(buffered);

        self.inner.store.delete_many(&ids)?;
        self.inner.metrics.reset();
        self.inner.lock_dedup().clear();

        warn!(discarded = ids.len(), "Queue cleared");
        self.inner.emit(QueueEvent::Cleared {
            size: self.inner.size(),
        });
        Ok(ids.len())
    }

    /// Re-enqueue a dead-lettered operation with a fresh retry budget.
    ///
    /// Bypasses deduplication and backpressure.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NotFound` if `id` is not dead-lettered, or a
    /// persistence error.
    pub fn retry_from_dlq(&self, id: &str) -> Result<(), QueueError> {
        let removed = self.inner.lock_dead_letters().remove(id);
        let Some(original) = removed else {
            return Err(QueueError::NotFound(format!("dead-lettered operation {id}")));
        };

        let mut op = original.clone();
        op.transition(OperationStatus::Pending)?;
        op.retry_count = 0;
        op.error_message = None;
        op.next_attempt_at = None;
        if let Err(e) = self.inner.store.save(&op) {
            self.inner.lock_dead_letters().insert(original);
            return Err(e);
        }

        let size = {
            let mut state = self.inner.lock_state();
            state.queue.push_back(op.clone());
            state.queue.len()
        };
        self.inner.idle_reported.store(false, Ordering::SeqCst);
        info!(id, module = %op.module, "Operation re-driven from dead-letter queue");
        self.inner.emit(QueueEvent::Enqueued { size, operation: op });
        self.inner.work.notify_one();
        Ok(())
    }

    /// Flush every batch buffer now. Returns how many operations were flushed.
    pub async fn flush_batches(&self) -> usize {
        self.inner.flush_all_batches().await
    }

    /// Delete processed rows older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn purge_processed(&self) -> Result<usize, QueueError> {
        self.inner.purge_processed()
    }

    /// Operations waiting in the tiers, delayed retries included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Whether nothing is queued, buffered or executing.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.inner.is_drained()
    }

    /// Wait until [`QueueManager::is_drained`] holds or shutdown begins.
    pub async fn wait_until_drained(&self) {
        while !self.inner.is_drained() && !self.inner.cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Find an operation that is queued, executing, buffered or dead-lettered.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Operation> {
        self.inner.find(id)
    }

    /// Dead-lettered operations, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<Operation> {
        self.inner.lock_dead_letters().list()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Breaker state of `module`.
    #[must_use]
    pub fn circuit_state(&self, module: &str) -> CircuitState {
        self.inner.breakers.state(module)
    }

    /// Open `module`'s breaker until its timeout elapses.
    pub fn force_open_circuit(&self, module: &str) {
        self.inner.breakers.force_open(module);
    }

    /// Close `module`'s breaker and clear its counters.
    pub fn reset_circuit(&self, module: &str) {
        self.inner.breakers.reset(module);
        self.inner.work.notify_waiters();
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Stop workers and timers, wait for them, then flush batches and the
    /// dedup snapshot. In-flight operations finish first.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.work.notify_waiters();

        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Queue task ended abnormally");
            }
        }

        let flushed = self.inner.flush_all_batches().await;
        self.inner.persist_dedup();
        info!(flushed, size = self.inner.size(), "Queue stopped");
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("size", &self.inner.size())
            .field("paused", &self.is_paused())
            .field("handlers", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::Value;
    use tokio::time::timeout;

    use super::*;
    use crate::queue::operation::Priority;
    use crate::queue::retry::RetryStrategy;
    use crate::storage::MemoryPersistence;
    use crate::telemetry::{MockObservability, NoopObservability};

    const SETTLE: Duration = Duration::from_secs(5);

    fn config() -> QueueConfig {
        QueueConfig {
            max_workers: 1,
            retry_strategy: RetryStrategy::Fixed,
            fixed_retry_delay_ms: 10,
            backoff_ms: 10,
            block_poll_ms: 10,
            rate_limit: 1000,
            ..QueueConfig::default()
        }
    }

    fn payload(tag: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert("tag".to_string(), Value::String(tag.to_string()));
        payload
    }

    fn op(id: &str, module: &str) -> Operation {
        Operation::new(id, module, "create_song", payload(id))
    }

    fn tag(payload: &Payload) -> String {
        payload
            .get("tag")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Registry whose `module.create_song` handler records tags and
    /// succeeds unless `fail` is set.
    fn recording(module: &str, seen: &Arc<Mutex<Vec<String>>>, fail: &Arc<AtomicBool>) -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        let seen = Arc::clone(seen);
        let fail = Arc::clone(fail);
        registry
            .register_fn(module, "create_song", move |payload| {
                let seen = Arc::clone(&seen);
                let fail = Arc::clone(&fail);
                async move {
                    seen.lock().unwrap().push(tag(&payload));
                    if fail.load(Ordering::SeqCst) {
                        Err(QueueError::Execution("remote unavailable".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .unwrap();
        registry
    }

    fn build(config: QueueConfig, registry: ExecutorRegistry) -> (QueueManager, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let manager = QueueManager::new(
            config,
            registry,
            Arc::clone(&persistence) as Arc<dyn Persistence>,
            Arc::new(NoopObservability),
        )
        .unwrap();
        (manager, persistence)
    }

    async fn settle(manager: &QueueManager) {
        timeout(SETTLE, manager.wait_until_drained()).await.unwrap();
    }

    fn stored(persistence: &Arc<MemoryPersistence>, id: &str) -> Option<Operation> {
        OperationStore::new(Arc::clone(persistence) as Arc<dyn Persistence>)
            .get(id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_higher_tier_dispatched_first() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let (manager, persistence) = build(config(), recording("lyrics", &seen, &fail));

        manager
            .enqueue(op("b", "lyrics").with_priority(Priority::Low))
            .await
            .unwrap();
        manager
            .enqueue(op("c", "lyrics").with_priority(Priority::Normal))
            .await
            .unwrap();
        manager
            .enqueue(op("a", "lyrics").with_priority(Priority::High))
            .await
            .unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        assert_eq!(*seen.lock().unwrap(), vec!["a", "c", "b"]);
        let a = stored(&persistence, "a").unwrap();
        assert_eq!(a.status, OperationStatus::Processed);
        assert!(a.processed_at.is_some());
        assert_eq!(manager.metrics().processed, 3);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_circuit_holds_operations() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(true));
        let config = QueueConfig {
            max_retries: 0,
            circuit_breaker_threshold: 2,
            circuit_breaker_timeout_ms: 400,
            ..config()
        };
        let (manager, _) = build(config, recording("sync", &seen, &fail));

        manager.enqueue(op("s1", "sync")).await.unwrap();
        manager.enqueue(op("s2", "sync")).await.unwrap();
        manager.start().unwrap();
        settle(&manager).await;
        assert_eq!(manager.circuit_state("sync"), CircuitState::Open);

        manager.enqueue(op("s3", "sync")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(manager.size(), 1);

        // The trial after the timeout runs s3.
        settle(&manager).await;
        assert_eq!(*seen.lock().unwrap(), vec!["s1", "s2", "s3"]);
        assert_eq!(manager.circuit_state("sync"), CircuitState::Open);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_stall_other_modules() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let mut registry = recording("lyrics", &seen, &fail);
        let sync_seen = Arc::clone(&seen);
        registry
            .register_fn("sync", "create_song", move |payload| {
                let seen = Arc::clone(&sync_seen);
                async move {
                    seen.lock().unwrap().push(tag(&payload));
                    Ok::<(), QueueError>(())
                }
            })
            .unwrap();
        let config = QueueConfig {
            max_workers: 2,
            ..config()
        };
        let (manager, _) = build(config, registry);

        manager.force_open_circuit("sync");
        manager
            .enqueue(op("s1", "sync").with_priority(Priority::High))
            .await
            .unwrap();
        manager
            .enqueue(op("l1", "lyrics").with_priority(Priority::Low))
            .await
            .unwrap();
        manager.start().unwrap();

        timeout(SETTLE, async {
            loop {
                if seen.lock().unwrap().iter().any(|t| t == "l1") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["l1"]);
        assert_eq!(manager.size(), 1);
        assert_eq!(manager.get("s1").map(|o| o.status), Some(OperationStatus::Pending));

        manager.reset_circuit("sync");
        settle(&manager).await;
        assert_eq!(*seen.lock().unwrap(), vec!["l1", "s1"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_end_in_dead_letter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(true));
        let config = QueueConfig {
            max_retries: 2,
            ..config()
        };
        let (manager, persistence) = build(config, recording("lyrics", &seen, &fail));

        manager.enqueue(op("x", "lyrics")).await.unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        assert_eq!(seen.lock().unwrap().len(), 3);
        let dead = manager.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 2);
        assert_eq!(dead[0].status, OperationStatus::DeadLetter);
        assert!(dead[0].error_message.is_some());

        let row = stored(&persistence, "x").unwrap();
        assert_eq!(row.status, OperationStatus::DeadLetter);
        assert_eq!(row.retry_count, 2);

        let metrics = manager.metrics();
        assert_eq!(metrics.failed, 3);
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.moved_to_dlq, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_retries_promote_priority() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(true));
        let (manager, _) = build(config(), recording("lyrics", &seen, &fail));

        manager
            .enqueue(op("x", "lyrics").with_priority(Priority::Low))
            .await
            .unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        let dead = manager.dead_letters();
        assert_eq!(dead[0].retry_count, 3);
        assert_eq!(dead[0].priority, Priority::Normal);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_throttled_handler_keeps_retry_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ExecutorRegistry::new();
        let counter = Arc::clone(&calls);
        registry
            .register_fn("sync", "create_song", move |_payload| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(QueueError::RateLimited("sync".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .unwrap();
        let (manager, persistence) = build(config(), registry);

        manager.enqueue(op("x", "sync")).await.unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let row = stored(&persistence, "x").unwrap();
        assert_eq!(row.status, OperationStatus::Processed);
        assert_eq!(row.retry_count, 0);
        assert_eq!(manager.metrics().failed, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_handler_is_permanent() {
        let config = QueueConfig {
            circuit_breaker_threshold: 1,
            ..config()
        };
        let (manager, _) = build(config, ExecutorRegistry::new());

        manager.enqueue(op("x", "lyrics")).await.unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        let dead = manager.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 0);
        assert_eq!(manager.circuit_state("lyrics"), CircuitState::Closed);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_panic_fails_operation() {
        let mut registry = ExecutorRegistry::new();
        registry
            .register_fn("lyrics", "create_song", |payload: Payload| async move {
                assert!(payload.is_empty(), "boom");
                Ok(())
            })
            .unwrap();
        let config = QueueConfig {
            max_retries: 0,
            ..config()
        };
        let (manager, _) = build(config, registry);

        manager.enqueue(op("x", "lyrics")).await.unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        let dead = manager.dead_letters();
        assert!(dead[0].error_message.as_deref().unwrap().contains("panicked"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicates_dropped_within_window() {
        let (manager, persistence) = build(config(), ExecutorRegistry::new());

        let first = Operation::new("1", "lyrics", "create_song", payload("same"));
        let second = Operation::new("2", "lyrics", "create_song", payload("same"));
        let third = Operation::new("3", "lyrics", "create_song", payload("same"));

        assert_eq!(manager.enqueue(first).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(manager.enqueue(second).await.unwrap(), EnqueueOutcome::Duplicate);
        let forced = manager
            .enqueue_with(third, EnqueueOptions { skip_deduplication: true })
            .await
            .unwrap();
        assert_eq!(forced, EnqueueOutcome::Enqueued);

        assert_eq!(manager.size(), 2);
        assert!(stored(&persistence, "2").is_none());
        assert_eq!(manager.metrics().duplicates_detected, 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_and_known_ids() {
        let (manager, _) = build(config(), ExecutorRegistry::new());

        let err = manager.enqueue(op("", "lyrics")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidOperation(_)));

        manager.enqueue(op("a", "lyrics")).await.unwrap();
        let again = Operation::new("a", "lyrics", "create_song", payload("other"));
        let err = manager.enqueue(again).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidOperation(_)));

        let mut processing = op("b", "lyrics");
        processing.status = OperationStatus::Processing;
        assert!(manager.enqueue(processing).await.is_err());
    }

    #[tokio::test]
    async fn test_backpressure_reject() {
        let config = QueueConfig {
            max_queue_size: 1,
            ..config()
        };
        let (manager, _) = build(config, ExecutorRegistry::new());

        manager.enqueue(op("a", "lyrics")).await.unwrap();
        let err = manager.enqueue(op("b", "lyrics")).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { max: 1 }));

        // The rejected operation is not remembered by the dedup index.
        manager.dequeue("a").unwrap();
        assert_eq!(
            manager.enqueue(op("b", "lyrics")).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
    }

    #[tokio::test]
    async fn test_backpressure_drop_oldest() {
        let config = QueueConfig {
            max_queue_size: 2,
            backpressure_strategy: BackpressureStrategy::DropOldest,
            ..config()
        };
        let (manager, persistence) = build(config, ExecutorRegistry::new());

        manager
            .enqueue(op("a", "lyrics").with_priority(Priority::Low))
            .await
            .unwrap();
        manager
            .enqueue(op("b", "lyrics").with_priority(Priority::High))
            .await
            .unwrap();
        manager.enqueue(op("c", "lyrics")).await.unwrap();

        assert_eq!(manager.size(), 2);
        assert!(manager.get("a").is_none());
        assert!(stored(&persistence, "a").is_none());
        assert!(manager.get("c").is_some());
        assert_eq!(manager.metrics().dropped, 1);

        // The dropped content is no longer treated as a duplicate.
        let again = Operation::new("a2", "lyrics", "create_song", payload("a"));
        assert_eq!(manager.enqueue(again).await.unwrap(), EnqueueOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_victim_when_delete_fails() {
        let config = QueueConfig {
            max_queue_size: 1,
            backpressure_strategy: BackpressureStrategy::DropOldest,
            ..config()
        };
        let (manager, persistence) = build(config, ExecutorRegistry::new());

        manager.enqueue(op("a", "lyrics")).await.unwrap();
        persistence.set_fail_deletes(true);
        let err = manager.enqueue(op("b", "lyrics")).await.unwrap_err();
        assert!(matches!(err, QueueError::Database(_)));

        assert!(manager.get("a").is_some());
        assert!(stored(&persistence, "a").is_some());
        assert!(manager.get("b").is_none());
        assert_eq!(manager.metrics().dropped, 0);

        // "b" was not remembered, so it is accepted once deletes work again.
        persistence.set_fail_deletes(false);
        assert_eq!(
            manager.enqueue(op("b", "lyrics")).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert!(manager.get("a").is_none());
    }

    #[tokio::test]
    async fn test_backpressure_block_waits_for_space() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let config = QueueConfig {
            max_queue_size: 1,
            backpressure_strategy: BackpressureStrategy::Block,
            ..config()
        };
        let (manager, _) = build(config, recording("lyrics", &seen, &fail));

        manager.enqueue(op("a", "lyrics")).await.unwrap();
        let blocked = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.enqueue(op("b", "lyrics")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        manager.start().unwrap();
        let outcome = timeout(SETTLE, blocked).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued);
        settle(&manager).await;
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_from_dlq_resets_budget() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(true));
        let config = QueueConfig {
            max_retries: 1,
            ..config()
        };
        let (manager, persistence) = build(config, recording("lyrics", &seen, &fail));

        manager.enqueue(op("x", "lyrics")).await.unwrap();
        manager.start().unwrap();
        settle(&manager).await;
        assert_eq!(manager.dead_letters().len(), 1);

        fail.store(false, Ordering::SeqCst);
        manager.retry_from_dlq("x").unwrap();
        settle(&manager).await;

        assert!(manager.dead_letters().is_empty());
        let row = stored(&persistence, "x").unwrap();
        assert_eq!(row.status, OperationStatus::Processed);
        assert_eq!(row.retry_count, 0);
        assert!(row.error_message.is_none());

        let err = manager.retry_from_dlq("missing").unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dequeue_removes_waiting_operation() {
        let (manager, persistence) = build(config(), ExecutorRegistry::new());

        manager.enqueue(op("a", "lyrics")).await.unwrap();
        assert!(manager.dequeue("a").unwrap());
        assert!(!manager.dequeue("a").unwrap());
        assert_eq!(manager.size(), 0);
        assert!(stored(&persistence, "a").is_none());

        // Same content is accepted again.
        let again = Operation::new("a2", "lyrics", "create_song", payload("a"));
        assert_eq!(manager.enqueue(again).await.unwrap(), EnqueueOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_dequeue_keeps_registration_of_other_operation() {
        let (manager, _) = build(config(), ExecutorRegistry::new());

        manager.enqueue(op("a", "lyrics")).await.unwrap();
        let copy = Operation::new("copy", "lyrics", "create_song", payload("a"));
        let outcome = manager
            .enqueue_with(copy, EnqueueOptions { skip_deduplication: true })
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued);

        // Cancelling the copy leaves "a"'s registration in place.
        assert!(manager.dequeue("copy").unwrap());
        let third = Operation::new("third", "lyrics", "create_song", payload("a"));
        assert_eq!(manager.enqueue(third).await.unwrap(), EnqueueOutcome::Duplicate);

        assert!(manager.dequeue("a").unwrap());
        let fourth = Operation::new("fourth", "lyrics", "create_song", payload("a"));
        assert_eq!(manager.enqueue(fourth).await.unwrap(), EnqueueOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let (manager, _) = build(config(), recording("lyrics", &seen, &fail));
        let mut events = manager.subscribe();

        manager.start().unwrap();
        manager.pause();
        assert!(manager.is_paused());
        manager.enqueue(op("a", "lyrics")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());

        manager.resume();
        settle(&manager).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        let paused = names.iter().position(|n| *n == "paused").unwrap();
        let resumed = names.iter().position(|n| *n == "resumed").unwrap();
        assert!(paused < resumed);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_discards_queue() {
        let (manager, persistence) = build(config(), ExecutorRegistry::new());
        let mut events = manager.subscribe();

        for id in ["a", "b", "c"] {
            manager.enqueue(op(id, "lyrics")).await.unwrap();
        }
        assert_eq!(manager.clear().unwrap(), 3);

        assert_eq!(manager.size(), 0);
        assert_eq!(persistence.row_count(crate::queue::store::OPERATIONS_TABLE), 0);
        assert_eq!(manager.metrics(), MetricsSnapshot::default());

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event.name());
        }
        assert_eq!(last, Some("cleared"));

        // Dedup was reset with the queue.
        assert_eq!(
            manager.enqueue(op("a", "lyrics")).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
    }

    fn batching() -> QueueConfig {
        QueueConfig {
            enable_batching: true,
            batch_modules: vec!["sync".to_string()],
            batch_size: 2,
            batch_flush_interval_ms: 60_000,
            ..config()
        }
    }

    #[tokio::test]
    async fn test_full_batch_commits_together() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let (manager, persistence) = build(batching(), recording("sync", &seen, &fail));

        manager.enqueue(op("a", "sync")).await.unwrap();
        manager.enqueue(op("b", "sync")).await.unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        assert_eq!(seen.lock().unwrap().len(), 2);
        for id in ["a", "b"] {
            assert_eq!(stored(&persistence, id).unwrap().status, OperationStatus::Processed);
        }
        let metrics = manager.metrics();
        assert_eq!(metrics.batches_processed, 1);
        assert_eq!(metrics.processed, 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_batched_module_respects_rate_limit() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ExecutorRegistry::new();
        let log = Arc::clone(&started);
        registry
            .register_fn("sync", "create_song", move |_payload| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(std::time::Instant::now());
                    Ok::<(), QueueError>(())
                }
            })
            .unwrap();
        let config = QueueConfig {
            rate_limit: 2,
            batch_size: 4,
            ..batching()
        };
        let (manager, _) = build(config, registry);

        for id in ["a", "b", "c", "d"] {
            manager.enqueue(op(id, "sync")).await.unwrap();
        }
        manager.start().unwrap();
        settle(&manager).await;

        let started = started.lock().unwrap().clone();
        assert_eq!(started.len(), 4);
        // Allow for scheduling jitter between the grant and the handler call.
        let window = Duration::from_millis(900);
        for (i, first) in started.iter().enumerate() {
            let in_window = started[i..]
                .iter()
                .take_while(|t| t.saturating_duration_since(*first) < window)
                .count();
            assert!(in_window <= 2, "{in_window} sync executions inside one second");
        }
        assert_eq!(manager.metrics().batches_processed, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_batch_commit_falls_back() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let (manager, persistence) = build(batching(), recording("sync", &seen, &fail));
        persistence.set_fail_transactions(true);

        manager.enqueue(op("a", "sync")).await.unwrap();
        manager.enqueue(op("b", "sync")).await.unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        // Handlers ran once each; statuses were written one by one.
        assert_eq!(seen.lock().unwrap().len(), 2);
        for id in ["a", "b"] {
            assert_eq!(stored(&persistence, id).unwrap().status, OperationStatus::Processed);
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_batch_flushed_on_shutdown() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let (manager, persistence) = build(batching(), recording("sync", &seen, &fail));

        manager.enqueue(op("a", "sync")).await.unwrap();
        manager.start().unwrap();
        timeout(SETTLE, async {
            while manager.size() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());

        manager.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
        assert_eq!(stored(&persistence, "a").unwrap().status, OperationStatus::Processed);
    }

    #[tokio::test]
    async fn test_restart_recovers_persisted_operations() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = OperationStore::new(Arc::clone(&persistence) as Arc<dyn Persistence>);
        {
            let manager = QueueManager::new(
                config(),
                ExecutorRegistry::new(),
                Arc::clone(&persistence) as Arc<dyn Persistence>,
                Arc::new(NoopObservability),
            )
            .unwrap();
            manager.enqueue(op("a", "lyrics")).await.unwrap();
            manager.enqueue(op("b", "lyrics")).await.unwrap();
        }
        let mut interrupted = op("c", "lyrics");
        interrupted.status = OperationStatus::Processing;
        store.insert(&interrupted).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let manager = QueueManager::new(
            config(),
            recording("lyrics", &seen, &fail),
            Arc::clone(&persistence) as Arc<dyn Persistence>,
            Arc::new(NoopObservability),
        )
        .unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        let mut tags = seen.lock().unwrap().clone();
        tags.sort();
        assert_eq!(tags, vec!["a", "b", "c"]);
        assert_eq!(store.counts().unwrap().get("processed"), Some(&3));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let (manager, _) = build(config(), recording("lyrics", &seen, &fail));
        let mut events = manager.subscribe();

        manager.start().unwrap();
        manager.enqueue(op("a", "lyrics")).await.unwrap();

        let mut names = Vec::new();
        timeout(SETTLE, async {
            loop {
                let event = events.recv().await.unwrap();
                names.push(event.name());
                if matches!(event, QueueEvent::Processed { .. }) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let expected = ["enqueued", "processing", "processed"];
        let relevant: Vec<_> = names.into_iter().filter(|n| expected.contains(n)).collect();
        assert_eq!(relevant, expected);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_reported_to_observability() {
        let captured = Arc::new(AtomicUsize::new(0));
        let mut observability = MockObservability::new();
        let counter = Arc::clone(&captured);
        observability
            .expect_capture_exception()
            .returning(move |_, context| {
                assert_eq!(context.get("operation_id"), Some(&Value::from("x")));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        observability.expect_add_breadcrumb().returning(|_, _, _| ());
        observability
            .expect_start_span()
            .returning(|_| tracing::Span::none());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(true));
        let config = QueueConfig {
            max_retries: 0,
            ..config()
        };
        let manager = QueueManager::new(
            config,
            recording("lyrics", &seen, &fail),
            Arc::new(MemoryPersistence::new()),
            Arc::new(observability),
        )
        .unwrap();

        manager.enqueue(op("x", "lyrics")).await.unwrap();
        manager.start().unwrap();
        settle(&manager).await;

        assert_eq!(captured.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let (manager, _) = build(config(), ExecutorRegistry::new());
        manager.start().unwrap();
        manager.shutdown().await;

        let err = manager.enqueue(op("a", "lyrics")).await.unwrap_err();
        assert!(matches!(err, QueueError::ShuttingDown));
        assert!(matches!(manager.start(), Err(QueueError::ShuttingDown)));
    }
}
