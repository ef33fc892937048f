//! Database migrations for opqueue.
//!
//! Each migration is a function that upgrades the schema by one version.
//! Migrations are run automatically when the database is opened.

use rusqlite::Connection;

use crate::error::QueueError;

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Get the current schema version from the database.
///
/// Returns 0 if no version has been set (new database).
///
/// # Errors
///
/// Returns an error if the pragma cannot be read.
pub fn get_version(conn: &Connection) -> Result<i32, QueueError> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| QueueError::Database(format!("Failed to get schema version: {e}")))
}

/// Set the schema version in the database.
fn set_version(conn: &Connection, version: i32) -> Result<(), QueueError> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .map_err(|e| QueueError::Database(format!("Failed to set schema version: {e}")))
}

/// Run all pending migrations.
///
/// # Errors
///
/// Returns an error if any migration fails.
pub fn run(conn: &Connection) -> Result<(), QueueError> {
    let current = get_version(conn)?;

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        run_migration(conn, version)?;
        set_version(conn, version)?;
    }

    Ok(())
}

/// Run a specific migration.
fn run_migration(conn: &Connection, version: i32) -> Result<(), QueueError> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => Err(QueueError::Database(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: operation queue.
fn migrate_v1(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS operation_queue (
            id TEXT PRIMARY KEY,
            module TEXT NOT NULL,
            action TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'normal',
            retry_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            created_at TEXT NOT NULL,
            processed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_operation_queue_status
        ON operation_queue(status);

        CREATE INDEX IF NOT EXISTS idx_operation_queue_created
        ON operation_queue(created_at);
        ",
    )
    .map_err(|e| QueueError::Database(format!("Migration v1 failed: {e}")))
}

/// Migration v2: retry scheduling and the persisted dedup index.
fn migrate_v2(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        r"
        ALTER TABLE operation_queue ADD COLUMN next_attempt_at TEXT;

        CREATE TABLE IF NOT EXISTS dedup_hashes (
            hash TEXT PRIMARY KEY,
            registered_at TEXT NOT NULL
        );
        ",
    )
    .map_err(|e| QueueError::Database(format!("Migration v2 failed: {e}")))
}

/// Migration v3: remember which operation registered each dedup hash.
fn migrate_v3(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch("ALTER TABLE dedup_hashes ADD COLUMN operation_id TEXT;")
        .map_err(|e| QueueError::Database(format!("Migration v3 failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_tables() {
        let conn = Connection::open_in_memory().unwrap();

        run(&conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);

        conn.execute(
            "INSERT INTO operation_queue (id, module, action, payload, created_at, next_attempt_at)
             VALUES ('a', 'lyrics', 'create_song', '{}', '2024-01-01T10:00:00Z', NULL)",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO dedup_hashes (hash, registered_at, operation_id)
             VALUES ('abc', '2024-01-01T10:00:00Z', 'a')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run(&conn).unwrap();
        run(&conn).unwrap();

        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_upgrade_from_v1() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_v1(&conn).unwrap();
        set_version(&conn, 1).unwrap();
        conn.execute(
            "INSERT INTO operation_queue (id, module, action, payload, created_at)
             VALUES ('old', 'sync', 'push', '{}', '2024-01-01T10:00:00Z')",
            [],
        )
        .unwrap();

        run(&conn).unwrap();

        let next: Option<String> = conn
            .query_row(
                "SELECT next_attempt_at FROM operation_queue WHERE id = 'old'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_get_version_new_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_version(&conn).unwrap(), 0);
    }
}
