//! Shell command handlers.
//!
//! A [`ShellExecutor`] runs one configured command per operation, writing
//! the payload as JSON to the command's stdin. Exit status 0 is success;
//! anything else fails the attempt with the command's stderr as the reason.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::HandlerConfig;
use crate::error::QueueError;
use crate::queue::{ExecutorRegistry, ModuleExecutor, Payload};

/// Runs an external command for each operation.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    command: String,
    args: Vec<String>,
}

impl ShellExecutor {
    /// Create an executor for `command` with `args`.
    #[must_use]
    pub const fn new(command: String, args: Vec<String>) -> Self {
        Self { command, args }
    }

    /// Create an executor from a `handlers` config entry.
    #[must_use]
    pub fn from_config(config: &HandlerConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl ModuleExecutor for ShellExecutor {
    async fn execute(&self, payload: &Payload) -> Result<(), QueueError> {
        let input = serde_json::to_vec(payload)?;
        debug!(command = %self.command, bytes = input.len(), "Running shell handler");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| QueueError::Execution(format!("Failed to start {}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that exits without reading its input is not an error.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(command = %self.command, error = %e, "Handler closed stdin early");
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr.trim();
        Err(QueueError::Execution(if reason.is_empty() {
            format!("{} exited with {}", self.command, output.status)
        } else {
            reason.to_string()
        }))
    }
}

/// Build a registry with one [`ShellExecutor`] per `handlers` entry.
///
/// # Errors
///
/// Returns `QueueError::DuplicateHandler` if two entries share a
/// `(module, action)` pair, or `QueueError::InvalidOperation` for empty names.
pub fn registry_from_config(handlers: &[HandlerConfig]) -> Result<ExecutorRegistry, QueueError> {
    let mut registry = ExecutorRegistry::new();
    for handler in handlers {
        registry.register(
            handler.module.clone(),
            handler.action.clone(),
            Arc::new(ShellExecutor::from_config(handler)),
        )?;
    }
    Ok(registry)
}
