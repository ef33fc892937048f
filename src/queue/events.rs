//! Lifecycle events published by the queue.

use serde::Serialize;

use super::operation::Operation;

/// One lifecycle change, with the queue size at the time it happened.
///
/// Subscribers receive these through a broadcast channel; a slow subscriber
/// lags and loses old events rather than stalling the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Nothing is waiting or in flight
    Idle {
        /// Current size
        size: usize,
    },
    /// An operation was accepted
    Enqueued {
        /// Current size
        size: usize,
        /// The accepted operation
        operation: Operation,
    },
    /// An operation was handed to its handler
    Processing {
        /// Current size
        size: usize,
        /// The dispatched operation
        operation: Operation,
    },
    /// An operation completed
    Processed {
        /// Current size
        size: usize,
        /// The completed operation
        operation: Operation,
    },
    /// An attempt failed; the operation is rescheduled or dead-lettered
    Failed {
        /// Current size
        size: usize,
        /// The operation after the failure was recorded
        operation: Operation,
    },
    /// Dispatch was paused
    Paused {
        /// Current size
        size: usize,
    },
    /// Dispatch was resumed
    Resumed {
        /// Current size
        size: usize,
    },
    /// Queued operations were discarded
    Cleared {
        /// Current size
        size: usize,
    },
}

impl QueueEvent {
    /// Queue size carried by the event.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::Idle { size }
            | Self::Enqueued { size, .. }
            | Self::Processing { size, .. }
            | Self::Processed { size, .. }
            | Self::Failed { size, .. }
            | Self::Paused { size }
            | Self::Resumed { size }
            | Self::Cleared { size } => *size,
        }
    }

    /// Affected operation, if any.
    #[must_use]
    pub const fn operation(&self) -> Option<&Operation> {
        match self {
            Self::Enqueued { operation, .. }
            | Self::Processing { operation, .. }
            | Self::Processed { operation, .. }
            | Self::Failed { operation, .. } => Some(operation),
            Self::Idle { .. } | Self::Paused { .. } | Self::Resumed { .. } | Self::Cleared { .. } => {
                None
            },
        }
    }

    /// Short name, e.g. for log lines.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle { .. } => "idle",
            Self::Enqueued { .. } => "enqueued",
            Self::Processing { .. } => "processing",
            Self::Processed { .. } => "processed",
            Self::Failed { .. } => "failed",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Cleared { .. } => "cleared",
        }
    }
}
