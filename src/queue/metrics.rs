//! Queue counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Process-wide counters, owned by the queue manager.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    moved_to_dlq: AtomicU64,
    dropped: AtomicU64,
    duplicates_detected: AtomicU64,
    batches_processed: AtomicU64,
    processing_time_ms: AtomicU64,
}

/// Point-in-time copy of [`QueueMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Operations accepted by enqueue
    pub enqueued: u64,
    /// Operations executed successfully
    pub processed: u64,
    /// Failed attempts
    pub failed: u64,
    /// Attempts rescheduled for retry
    pub retried: u64,
    /// Operations moved to the dead-letter queue
    pub moved_to_dlq: u64,
    /// Operations evicted by backpressure
    pub dropped: u64,
    /// Enqueues rejected as duplicates
    pub duplicates_detected: u64,
    /// Batches flushed
    pub batches_processed: u64,
    /// Cumulative handler time
    pub total_processing_time_ms: u64,
    /// Mean handler time per processed operation
    pub average_processing_time_ms: f64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl QueueMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_enqueued(&self) {
        bump(&self.enqueued);
    }

    pub(crate) fn record_processed(&self, elapsed: Duration) {
        bump(&self.processed);
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.processing_time_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        bump(&self.failed);
    }

    pub(crate) fn record_retried(&self) {
        bump(&self.retried);
    }

    pub(crate) fn record_dead_lettered(&self) {
        bump(&self.moved_to_dlq);
    }

    pub(crate) fn record_dropped(&self) {
        bump(&self.dropped);
    }

    pub(crate) fn record_duplicate(&self) {
        bump(&self.duplicates_detected);
    }

    pub(crate) fn record_batch(&self) {
        bump(&self.batches_processed);
    }

    /// Zero every counter.
    pub(crate) fn reset(&self) {
        for counter in [
            &self.enqueued,
            &self.processed,
            &self.failed,
            &self.retried,
            &self.moved_to_dlq,
            &self.dropped,
            &self.duplicates_detected,
            &self.batches_processed,
            &self.processing_time_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Copy the current values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total = self.processing_time_ms.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let average = if processed == 0 {
            0.0
        } else {
            total as f64 / processed as f64
        };

        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed,
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            moved_to_dlq: self.moved_to_dlq.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicates_detected: self.duplicates_detected.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            total_processing_time_ms: total,
            average_processing_time_ms: average,
        }
    }
}
