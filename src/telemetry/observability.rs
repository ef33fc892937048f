//! Best-effort telemetry sink used by the queue.
//!
//! Implementations must not fail or block: the queue calls them from the
//! dispatch path and ignores whatever they do.

use tracing::{debug, error, info_span, Span};

use crate::error::QueueError;
use crate::queue::Payload;

/// Error reporting, breadcrumbs and spans.
#[cfg_attr(test, mockall::automock)]
pub trait Observability: Send + Sync {
    /// Report a failure with structured context.
    fn capture_exception(&self, error: &QueueError, context: &Payload);

    /// Record a breadcrumb leading up to a later failure.
    fn add_breadcrumb(&self, message: &str, category: &str, data: &Payload);

    /// Open a span around one unit of work.
    fn start_span(&self, name: &str) -> Span;
}

/// Forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObservability;

impl Observability for TracingObservability {
    fn capture_exception(&self, err: &QueueError, context: &Payload) {
        let context = serde_json::Value::Object(context.clone());
        error!(error = %err, context = %context, "Operation failed");
    }

    fn add_breadcrumb(&self, message: &str, category: &str, data: &Payload) {
        let data = serde_json::Value::Object(data.clone());
        debug!(category, data = %data, "{message}");
    }

    fn start_span(&self, name: &str) -> Span {
        info_span!("op", name = %name)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObservability;

impl Observability for NoopObservability {
    fn capture_exception(&self, _error: &QueueError, _context: &Payload) {}

    fn add_breadcrumb(&self, _message: &str, _category: &str, _data: &Payload) {}

    fn start_span(&self, _name: &str) -> Span {
        Span::none()
    }
}
