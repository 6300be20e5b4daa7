use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(i64),

    #[error("Project already queued or unfinished: {0}")]
    DuplicateProject(String),

    #[error("Invalid status transition for project {id}: {from} -> {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("Timed out after {waited:?} waiting for lock on project {id}")]
    LockTimeout { id: i64, waited: Duration },

    #[error("Scheduler already running: {0}")]
    SchedulerRunning(String),

    #[error("Worker launch failed: {0}")]
    Launch(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for SQLite BUSY/LOCKED failures, which callers treat as "try again later".
    pub fn is_busy(&self) -> bool {
        match self {
            Error::Database(e) => is_busy(e),
            _ => false,
        }
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
