//! Operation types for the queue.
//!
//! An [`Operation`] is one captured mutation (module + action + payload)
//! waiting to be replayed against the remote system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Opaque operation payload. Key order is preserved.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Priority tiers, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Low,
    /// Default tier
    #[default]
    Normal,
    /// User-visible work
    High,
    /// Must go out first
    Critical,
}

impl Priority {
    /// All tiers from highest to lowest, in scan order.
    pub const SCAN_ORDER: [Self; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// The next tier up, capped at [`Priority::Critical`].
    #[must_use]
    pub const fn promote(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Index of the tier, 0 for low.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Stable name used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(QueueError::Parse(format!("Unknown priority: {other}"))),
        }
    }
}

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be dispatched
    Pending,
    /// Handed to a handler
    Processing,
    /// Successfully executed
    Processed,
    /// Last attempt failed
    Error,
    /// Retry budget exhausted
    DeadLetter,
    /// Removed before processing started
    Cancelled,
}

impl OperationStatus {
    /// Check if this status is terminal (no more action needed).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Cancelled)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Cancelled)
                | (Self::Processing, Self::Processed | Self::Error | Self::Pending)
                | (Self::Error, Self::Pending | Self::DeadLetter)
                | (Self::DeadLetter, Self::Pending)
        )
    }

    /// Stable name used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Error => "error",
            Self::DeadLetter => "dead_letter",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "error" => Ok(Self::Error),
            "dead_letter" | "deadletter" | "dlq" => Ok(Self::DeadLetter),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(QueueError::Parse(format!("Unknown status: {other}"))),
        }
    }
}

/// A queued operation with metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique ID, kept across retries
    pub id: String,
    /// Business module the operation belongs to
    pub module: String,
    /// Action within the module
    pub action: String,
    /// Opaque payload handed to the handler
    pub payload: Payload,
    /// Current priority tier
    pub priority: Priority,
    /// Number of failed attempts so far
    pub retry_count: u32,
    /// Current status
    pub status: OperationStatus,
    /// Last error message
    pub error_message: Option<String>,
    /// When the operation was captured
    pub created_at: DateTime<Utc>,
    /// When the operation was successfully processed
    pub processed_at: Option<DateTime<Utc>>,
    /// Earliest time of the next attempt, set on retry
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Create a new pending operation.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        module: impl Into<String>,
        action: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: id.into(),
            module: module.into(),
            action: action.into(),
            payload,
            priority: Priority::Normal,
            retry_count: 0,
            status: OperationStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
            next_attempt_at: None,
        }
    }

    /// Set the priority tier.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Reject operations missing an id, module or action.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidOperation` naming the empty field.
    pub fn validate(&self) -> Result<(), QueueError> {
        for (field, value) in [
            ("id", &self.id),
            ("module", &self.module),
            ("action", &self.action),
        ] {
            if value.trim().is_empty() {
                return Err(QueueError::InvalidOperation(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    /// Move to `next`, enforcing the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidTransition` if the lifecycle forbids the move.
    pub fn transition(&mut self, next: OperationStatus) -> Result<(), QueueError> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Handler key for the registry.
    #[must_use]
    pub fn key(&self) -> (&str, &str) {
        (&self.module, &self.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: &str) -> Operation {
        Operation::new(id, "lyrics", "create_song", Payload::new())
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::SCAN_ORDER[0], Priority::Critical);
    }

    #[test]
    fn test_priority_promote_caps() {
        assert_eq!(Priority::Low.promote(), Priority::Normal);
        assert_eq!(Priority::High.promote(), Priority::Critical);
        assert_eq!(Priority::Critical.promote(), Priority::Critical);
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        assert!(op("a").validate().is_ok());
        assert!(matches!(op("").validate(), Err(QueueError::InvalidOperation(_))));

        let mut no_module = op("a");
        no_module.module = "  ".to_string();
        assert!(no_module.validate().is_err());

        let mut no_action = op("a");
        no_action.action.clear();
        assert!(no_action.validate().is_err());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut operation = op("a");
        operation.transition(OperationStatus::Processing).unwrap();
        operation.transition(OperationStatus::Error).unwrap();
        operation.transition(OperationStatus::Pending).unwrap();
        operation.transition(OperationStatus::Processing).unwrap();
        operation.transition(OperationStatus::Processed).unwrap();
        assert!(operation.status.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut operation = op("a");
        let err = operation.transition(OperationStatus::Processed).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(operation.status, OperationStatus::Pending);

        operation.transition(OperationStatus::Processing).unwrap();
        assert!(operation.transition(OperationStatus::Cancelled).is_err());
        assert!(operation.transition(OperationStatus::DeadLetter).is_err());
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Processing,
            OperationStatus::Processed,
            OperationStatus::Error,
            OperationStatus::DeadLetter,
            OperationStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<OperationStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn test_operation_serialization() {
        let mut payload = Payload::new();
        payload.insert("title".to_string(), serde_json::json!("Hallelujah"));
        let operation = Operation::new("a", "lyrics", "create_song", payload)
            .with_priority(Priority::High);

        let json = serde_json::to_string(&operation).expect("should serialize");
        assert!(json.contains("\"priority\":\"high\""));
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"title\":\"Hallelujah\""));
    }
}
