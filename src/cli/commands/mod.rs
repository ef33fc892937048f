//! Command implementations for opqueue.
//!
//! Each command returns the text to print; `main` writes it to stdout.

mod inspect;
mod queue;
mod run;

pub use inspect::{dlq_list, list, status};
pub use queue::{clear, dequeue, dlq_retry, enqueue, purge};
pub use run::run;

use std::sync::Arc;

use crate::config::{Config, Paths};
use crate::error::QueueError;
use crate::queue::{ExecutorRegistry, OperationStore, QueueManager};
use crate::storage::{Persistence, SqlitePersistence};
use crate::telemetry::TracingObservability;

/// Resolved paths, configuration and storage shared by every command.
pub struct Context {
    /// Config and database locations
    pub paths: Paths,
    /// Loaded configuration
    pub config: Config,
    /// Operation rows
    pub store: OperationStore,
    persistence: Arc<dyn Persistence>,
}

impl Context {
    /// Open the database for an already loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(paths: Paths, config: Config) -> Result<Self, QueueError> {
        paths.ensure_dirs()?;
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::open_at(&paths.database)?);
        Ok(Self {
            store: OperationStore::new(Arc::clone(&persistence)),
            paths,
            config,
            persistence,
        })
    }

    /// Build a manager over this context's storage.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Config` if the queue settings are invalid.
    pub fn manager(&self, registry: ExecutorRegistry) -> Result<QueueManager, QueueError> {
        QueueManager::new(
            self.config.queue.clone(),
            registry,
            Arc::clone(&self.persistence),
            Arc::new(TracingObservability),
        )
    }

    /// Build a manager and load the persisted queue without starting workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or state cannot be loaded.
    pub fn loaded_manager(&self) -> Result<QueueManager, QueueError> {
        let manager = self.manager(ExecutorRegistry::new())?;
        manager.load()?;
        Ok(manager)
    }
}
