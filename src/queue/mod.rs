//! Durable operation queue.
//!
//! Mutations are captured as [`Operation`]s, persisted and replayed against
//! module handlers by a worker pool.
//!
//! Features:
//! - Priority tiers with promotion of repeatedly retried operations
//! - Deduplication, backpressure and per-module rate limiting
//! - Per-module circuit breakers
//! - Retry policies with a dead-letter queue
//! - Optional batching with an atomic status commit
//! - Recovery of persisted state on start

mod batch;
pub mod circuit_breaker;
pub mod dedup;
pub mod events;
pub mod executor;
mod manager;
pub mod metrics;
pub mod operation;
pub mod priority;
pub mod rate_limiter;
pub mod retry;
pub mod store;
mod worker;

pub use batch::BatchBuffers;
pub use circuit_breaker::{CircuitBreakers, CircuitSnapshot, CircuitState};
pub use dedup::{operation_hash, DedupEntry, DeduplicationIndex};
pub use events::QueueEvent;
pub use executor::{ExecutorRegistry, FnExecutor, ModuleExecutor};
pub use manager::{EnqueueOptions, EnqueueOutcome, QueueManager};
pub use metrics::{MetricsSnapshot, QueueMetrics};
pub use operation::{Operation, OperationStatus, Payload, Priority};
pub use priority::{DeadLetterStore, PriorityQueueSet};
pub use rate_limiter::RateLimiters;
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::OperationStore;
