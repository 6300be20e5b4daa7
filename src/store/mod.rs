//! Durable store: the SQLite file every scheduler process shares.
//!
//! The store is the single source of truth for cross-process agreement.
//! One `Store` owns one connection; the daemon's composition root creates it
//! and hands `Arc<Store>` to every component. Other processes (the CLI, a
//! second scheduler) open their own connection to the same file, and SQLite's
//! write lock arbitrates between them.

mod migration;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::{slog_debug, Result};

pub use migration::SCHEMA_VERSION;

/// How long a statement waits on another writer before reporting BUSY.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (creating if needed) the database file and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        slog_debug!("Store::open path={}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // WAL lets readers (status queries, monitors) proceed while a claim
        // transaction holds the write lock.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        migration::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory store, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migration::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Exclusive access to the connection. A poisoned mutex only means another
    /// thread panicked mid-call; SQLite itself rolled back, so keep going.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically increment and return the named counter (first call returns 1).
    pub fn next_sequence(&self, name: &str) -> Result<i64> {
        let conn = self.conn();
        let value = conn.query_row(
            "INSERT INTO sequence_generator (name, current_value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET current_value = current_value + 1
             RETURNING current_value",
            params![name],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    pub fn current_sequence(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT current_value FROM sequence_generator WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Record who currently holds a named lock (informational; the file lock
    /// is authoritative).
    pub fn record_lock_holder(&self, holder: &LockHolderRecord) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO lock_metadata (name, holder_pid, hostname, signature, acquired_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                holder_pid = excluded.holder_pid,
                hostname = excluded.hostname,
                signature = excluded.signature,
                acquired_at = excluded.acquired_at",
            params![
                holder.name,
                holder.holder_pid,
                holder.hostname,
                holder.signature,
                holder.acquired_at
            ],
        )?;
        Ok(())
    }

    pub fn clear_lock_holder(&self, name: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM lock_metadata WHERE name = ?1", params![name])?;
        Ok(())
    }

    pub fn lock_holder(&self, name: &str) -> Result<Option<LockHolderRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT name, holder_pid, hostname, signature, acquired_at
                 FROM lock_metadata WHERE name = ?1",
                params![name],
                |row| {
                    Ok(LockHolderRecord {
                        name: row.get(0)?,
                        holder_pid: row.get(1)?,
                        hostname: row.get(2)?,
                        signature: row.get(3)?,
                        acquired_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

/// Row of the `lock_metadata` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolderRecord {
    pub name: String,
    pub holder_pid: u32,
    pub hostname: String,
    pub signature: String,
    pub acquired_at: String,
}
