use tracing::{info, warn};

use crate::cli::args::{OutputFormat, RunArgs};
use crate::error::QueueError;
use crate::executors::registry_from_config;
use crate::output::format_run_summary;

use super::Context;

/// Execute run command
///
/// Starts the worker pool with one shell handler per configured entry and
/// processes until the queue drains, or until Ctrl-C with `--follow`.
///
/// # Errors
///
/// Returns an error if the handlers or queue settings are invalid, or the
/// persisted queue cannot be loaded.
pub async fn run(ctx: &Context, args: &RunArgs, format: OutputFormat) -> Result<String, QueueError> {
    let registry = registry_from_config(&ctx.config.handlers)?;
    if registry.is_empty() {
        warn!("No handlers configured; operations will be dead-lettered as unsupported");
    }

    let manager = ctx.manager(registry)?;
    manager.start()?;

    if args.follow {
        info!("Processing until interrupted");
        tokio::signal::ctrl_c().await?;
    } else {
        tokio::select! {
            () = manager.wait_until_drained() => {},
            result = tokio::signal::ctrl_c() => result?,
        }
    }

    manager.shutdown().await;
    format_run_summary(
        &manager.metrics(),
        manager.size(),
        manager.dead_letters().len(),
        format,
    )
}
