//! Path resolution for opqueue configuration and data files.
//!
//! All opqueue data is stored in `~/.opqueue/`:
//! - `config.yaml` - Main configuration file
//! - `opqueue.db` - SQLite database holding the operation queue

use std::path::PathBuf;

use crate::error::QueueError;

/// Paths to opqueue configuration and data files.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root directory: `~/.opqueue/`
    pub root: PathBuf,
    /// Config file: `~/.opqueue/config.yaml`
    pub config_file: PathBuf,
    /// Database file: `~/.opqueue/opqueue.db`
    pub database: PathBuf,
}

impl Paths {
    /// Create paths based on the user's home directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self, QueueError> {
        let home = std::env::var("HOME").map_err(|_| {
            QueueError::Config("Could not determine home directory".to_string())
        })?;

        Ok(Self::with_root(PathBuf::from(home).join(".opqueue")))
    }

    /// Create paths with a custom root directory (useful for testing).
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            config_file: root.join("config.yaml"),
            database: root.join("opqueue.db"),
            root,
        }
    }

    /// Replace the config file and database locations where overrides are given.
    #[must_use]
    pub fn with_overrides(mut self, config: Option<PathBuf>, database: Option<PathBuf>) -> Self {
        if let Some(config) = config {
            self.config_file = config;
        }
        if let Some(database) = database {
            self.database = database;
        }
        self
    }

    /// Ensure the directories holding the config file and database exist.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn ensure_dirs(&self) -> Result<(), QueueError> {
        let dirs = [
            Some(self.root.as_path()),
            self.config_file.parent(),
            self.database.parent(),
        ];

        for dir in dirs.into_iter().flatten() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    QueueError::Config(format!("Failed to create directory {}: {e}", dir.display()))
                })?;
            }
        }

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_root(PathBuf::from(".opqueue")))
    }
}
