//! Logging setup and the observability collaborator.

mod observability;

pub use observability::{NoopObservability, Observability, TracingObservability};

#[cfg(test)]
pub use observability::MockObservability;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::QueueError;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.level`. Output goes to stderr so command
/// output on stdout stays machine-readable.
///
/// # Errors
///
/// Returns `QueueError::Config` if the filter is invalid or a subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), QueueError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| QueueError::Config(format!("Invalid log level {:?}: {e}", config.level)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| QueueError::Config(format!("Failed to initialise logging: {e}")))
}
