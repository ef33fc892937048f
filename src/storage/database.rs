//! `SQLite` database connection.
//!
//! The database is stored at `~/.opqueue/opqueue.db` and holds the
//! operation queue and the persisted deduplication index.

use rusqlite::Connection;

use crate::error::QueueError;

use super::migrations;

/// Database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database at a specific path.
    ///
    /// Creates the database file and runs migrations if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_at(path: &std::path::Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path).map_err(|e| {
            QueueError::Database(format!("Failed to open database {}: {e}", path.display()))
        })?;

        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(|e| QueueError::Database(format!("Failed to enable WAL: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| QueueError::Database(format!("Failed to set busy timeout: {e}")))?;

        let db = Self { conn };
        db.migrate()?;

        Ok(db)
    }

    /// Open an in-memory database (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            QueueError::Database(format!("Failed to open in-memory database: {e}"))
        })?;

        let db = Self { conn };
        db.migrate()?;

        Ok(db)
    }

    fn migrate(&self) -> Result<(), QueueError> {
        migrations::run(&self.conn)
    }

    /// Get the current schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the version cannot be read.
    pub fn schema_version(&self) -> Result<i32, QueueError> {
        migrations::get_version(&self.conn)
    }

    /// Get a reference to the underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, needed to open transactions.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
