//! Error types for opqueue.

use thiserror::Error;

use crate::queue::OperationStatus;

/// Errors produced by the queue core and its collaborators.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The operation is malformed and was rejected at enqueue.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The queue is at capacity and the backpressure policy rejected the operation.
    #[error("Queue is full ({max} operations)")]
    QueueFull {
        /// Configured maximum queue size.
        max: usize,
    },

    /// No handler is registered for the module/action pair.
    #[error("Unsupported operation: {module}.{action}")]
    UnsupportedOperation {
        /// Module name.
        module: String,
        /// Action name.
        action: String,
    },

    /// The module's circuit breaker is open.
    #[error("Circuit breaker open for module '{0}'")]
    CircuitBreakerOpen(String),

    /// The module's rate limiter has no tokens available.
    #[error("Rate limit reached for module '{0}'")]
    RateLimited(String),

    /// A handler failed to execute the operation.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// A collaborator could not decrypt stored data.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// An operation status change that the lifecycle does not allow.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: OperationStatus,
        /// Requested status.
        to: OperationStatus,
    },

    /// A handler was registered twice for the same module/action pair.
    #[error("Handler already registered for {module}.{action}")]
    DuplicateHandler {
        /// Module name.
        module: String,
        /// Action name.
        action: String,
    },

    /// The queue manager is shutting down.
    #[error("Queue is shutting down")]
    ShuttingDown,

    /// Persistence error.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Item not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Parse or serialization error.
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Whether this failure must never be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidOperation(_) | Self::UnsupportedOperation { .. }
        )
    }

    /// Whether this condition is handled by requeue and backoff without
    /// consuming retry budget.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::CircuitBreakerOpen(_) | Self::RateLimited(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(QueueError::InvalidOperation("empty id".to_string()).is_permanent());
        assert!(QueueError::UnsupportedOperation {
            module: "lyrics".to_string(),
            action: "explode".to_string(),
        }
        .is_permanent());
        assert!(!QueueError::Execution("timeout".to_string()).is_permanent());
        assert!(!QueueError::Decryption("bad key".to_string()).is_permanent());
    }

    #[test]
    fn test_transient_classification() {
        assert!(QueueError::CircuitBreakerOpen("sync".to_string()).is_transient());
        assert!(QueueError::RateLimited("sync".to_string()).is_transient());
        assert!(!QueueError::QueueFull { max: 10 }.is_transient());
    }

    #[test]
    fn test_display() {
        let err = QueueError::UnsupportedOperation {
            module: "lyrics".to_string(),
            action: "explode".to_string(),
        };
        assert_eq!(err.to_string(), "Unsupported operation: lyrics.explode");
        assert_eq!(
            QueueError::QueueFull { max: 3 }.to_string(),
            "Queue is full (3 operations)"
        );
    }
}
