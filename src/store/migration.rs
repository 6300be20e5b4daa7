//! Schema creation and upgrades.
//!
//! Versions are tracked in `PRAGMA user_version`. Each step is idempotent so
//! two processes opening a fresh database at the same moment both succeed.

use rusqlite::Connection;

use crate::{slog, slog_debug, Result};

/// Schema version written by this build.
pub const SCHEMA_VERSION: i64 = 2;

const V1: &str = "
CREATE TABLE IF NOT EXISTS project_queue (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    spec_path     TEXT    NOT NULL,
    project_path  TEXT,
    status        TEXT    NOT NULL DEFAULT 'queued',
    priority      INTEGER NOT NULL DEFAULT 5,
    session_name  TEXT,
    process_pid   INTEGER,
    enqueued_at   TEXT    NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_project_queue_claim
    ON project_queue (status, priority, enqueued_at);
CREATE INDEX IF NOT EXISTS idx_project_queue_spec
    ON project_queue (spec_path, status);
CREATE TABLE IF NOT EXISTS sequence_generator (
    name          TEXT PRIMARY KEY,
    current_value INTEGER NOT NULL
);
";

const V2_TABLES: &str = "
CREATE TABLE IF NOT EXISTS lock_metadata (
    name        TEXT PRIMARY KEY,
    holder_pid  INTEGER NOT NULL,
    hostname    TEXT    NOT NULL,
    signature   TEXT    NOT NULL,
    acquired_at TEXT    NOT NULL
);
";

/// Columns added to `project_queue` in version 2.
const V2_COLUMNS: &[(&str, &str)] = &[
    ("main_session", "TEXT"),
    ("orchestrator_session", "TEXT"),
    ("merged_status", "TEXT"),
];

pub(super) fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    slog_debug!("Store schema version {} (target {})", version, SCHEMA_VERSION);
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(V1)?;
    conn.execute_batch(V2_TABLES)?;
    for (column, ty) in V2_COLUMNS {
        if !column_exists(conn, "project_queue", column)? {
            conn.execute_batch(&format!(
                "ALTER TABLE project_queue ADD COLUMN {} {}",
                column, ty
            ))?;
        }
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    if version > 0 {
        slog!("Migrated store schema from v{} to v{}", version, SCHEMA_VERSION);
    }
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert!(column_exists(&conn, "project_queue", "merged_status").unwrap());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }

    #[test]
    fn test_v1_database_gains_new_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute(
            "INSERT INTO project_queue (spec_path, enqueued_at) VALUES ('a.md', '2026-01-01')",
            [],
        )
        .unwrap();

        migrate(&conn).unwrap();

        for (column, _) in V2_COLUMNS {
            assert!(column_exists(&conn, "project_queue", column).unwrap());
        }
        let kept: String = conn
            .query_row("SELECT spec_path FROM project_queue", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, "a.md");
    }
}
