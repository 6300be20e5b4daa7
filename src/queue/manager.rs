//! Queue operations over the shared store.
//!
//! Every mutation runs inside an `IMMEDIATE` transaction so the read that
//! validates a row and the write that changes it see the same snapshot, even
//! when another scheduler process is working on the same database file.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;

use crate::error::is_busy;
use crate::store::Store;
use crate::util::format_ts;
use crate::{slog, slog_debug, slog_warn, Error, Result};

use super::state::{can_reset, check_transition};
use super::types::PROJECT_COLUMNS;
use super::{ClaimedProject, MergedStatus, Project, ProjectStatus};

pub const DEFAULT_PRIORITY: i64 = 5;

/// Optional fields written alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    notes: Option<String>,
    session_name: Option<String>,
    process_pid: Option<u32>,
}

impl StatusUpdate {
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn session(mut self, session_name: impl Into<String>) -> Self {
        self.session_name = Some(session_name.into());
        self
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.process_pid = Some(pid);
        self
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub by_status: BTreeMap<ProjectStatus, u64>,
}

impl QueueCounts {
    pub fn get(&self, status: ProjectStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.by_status.values().sum()
    }

    pub fn active(&self) -> u64 {
        self.get(ProjectStatus::Processing) + self.get(ProjectStatus::TimingOut)
    }
}

pub struct QueueManager {
    store: Arc<Store>,
}

impl QueueManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn immediate<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.store.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Add a spec file to the queue.
    ///
    /// Returns `None` while a row for the same spec has not yet completed or
    /// failed.
    pub fn enqueue(
        &self,
        spec_path: &str,
        project_path: Option<&str>,
        priority: i64,
    ) -> Result<Option<i64>> {
        if spec_path.trim().is_empty() {
            return Err(Error::Validation("spec path cannot be empty".to_string()));
        }
        let now = format_ts(&Utc::now());
        let id = self.immediate(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM project_queue
                     WHERE spec_path = ?1 AND status NOT IN ('completed', 'failed')
                     LIMIT 1",
                    params![spec_path],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                slog_debug!(
                    "enqueue: {} already active as project {}",
                    spec_path,
                    existing
                );
                return Ok(None);
            }
            tx.execute(
                "INSERT INTO project_queue (spec_path, project_path, status, priority, enqueued_at)
                 VALUES (?1, ?2, 'queued', ?3, ?4)",
                params![spec_path, project_path, priority, now],
            )?;
            Ok(Some(tx.last_insert_rowid()))
        })?;
        if let Some(id) = id {
            slog!("Enqueued project {} ({}) priority {}", id, spec_path, priority);
        }
        Ok(id)
    }

    /// Atomically claim the highest-priority queued row.
    ///
    /// Lower priority numbers win, ties go to the oldest row. Contention with
    /// another writer is reported as "nothing claimed" so the caller simply
    /// retries on its next tick.
    pub fn claim_next(&self) -> Result<Option<ClaimedProject>> {
        match self.try_claim(Utc::now()) {
            Ok(claimed) => Ok(claimed),
            Err(Error::Database(e)) if is_busy(&e) => {
                slog_debug!("claim_next: store busy, skipping this round");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn try_claim(&self, now: DateTime<Utc>) -> Result<Option<ClaimedProject>> {
        let now = format_ts(&now);
        let claimed = self.immediate(|tx| {
            let candidate = tx
                .query_row(
                    "SELECT id, spec_path, project_path FROM project_queue
                     WHERE status = 'queued'
                     ORDER BY priority ASC, enqueued_at ASC, id ASC
                     LIMIT 1",
                    [],
                    |row| {
                        Ok(ClaimedProject {
                            id: row.get(0)?,
                            spec_path: row.get(1)?,
                            project_path: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            let Some(candidate) = candidate else {
                return Ok(None);
            };
            let changed = tx.execute(
                "UPDATE project_queue
                 SET status = 'processing', started_at = ?1, completed_at = NULL,
                     error_message = NULL
                 WHERE id = ?2 AND status = 'queued'",
                params![now, candidate.id],
            )?;
            if changed != 1 {
                return Ok(None);
            }
            Ok(Some(candidate))
        })?;
        if let Some(ref project) = claimed {
            slog!("Claimed project {} ({})", project.id, project.spec_path);
        }
        Ok(claimed)
    }

    /// Move a row to `new_status`, rejecting transitions not in the table.
    pub fn update_status(
        &self,
        id: i64,
        new_status: ProjectStatus,
        update: StatusUpdate,
    ) -> Result<Project> {
        let now = format_ts(&Utc::now());
        let project = self.immediate(|tx| {
            let current = select_project(tx, id)?.ok_or(Error::ProjectNotFound(id))?;
            check_transition(id, current.status, new_status)?;

            let (started_at, completed_at) = match new_status {
                ProjectStatus::Processing => (Some(now.clone()), None),
                ProjectStatus::Completed | ProjectStatus::Failed => (None, Some(now.clone())),
                _ => (None, None),
            };
            let clears_pid = new_status.is_terminal();
            tx.execute(
                "UPDATE project_queue SET
                    status = ?1,
                    started_at = COALESCE(?2, started_at),
                    completed_at = CASE WHEN ?3 IS NOT NULL THEN ?3
                                        WHEN ?1 = 'processing' THEN NULL
                                        ELSE completed_at END,
                    error_message = COALESCE(?4, error_message),
                    session_name = COALESCE(?5, session_name),
                    process_pid = CASE WHEN ?7 THEN NULL ELSE COALESCE(?6, process_pid) END
                 WHERE id = ?8 AND status = ?9",
                params![
                    new_status.as_str(),
                    started_at,
                    completed_at,
                    update.notes,
                    update.session_name,
                    update.process_pid,
                    clears_pid,
                    id,
                    current.status.as_str()
                ],
            )?;
            select_project(tx, id)?.ok_or(Error::ProjectNotFound(id))
        })?;
        slog!(
            "Project {} -> {}{}",
            id,
            new_status,
            project
                .error_message
                .as_deref()
                .filter(|_| new_status == ProjectStatus::Failed)
                .map(|m| format!(" ({})", m))
                .unwrap_or_default()
        );
        Ok(project)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let conn = self.store.conn();
        let project = conn
            .query_row(
                &format!("SELECT {} FROM project_queue WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                Project::from_row,
            )
            .optional()?;
        Ok(project)
    }

    /// All rows, or only rows in `status`, in claim order.
    pub fn list_projects(&self, status: Option<ProjectStatus>) -> Result<Vec<Project>> {
        let conn = self.store.conn();
        let sql = format!(
            "SELECT {} FROM project_queue
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY priority ASC, enqueued_at ASC, id ASC",
            PROJECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], Project::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn projects_in(&self, statuses: &[ProjectStatus]) -> Result<Vec<Project>> {
        let mut out = Vec::new();
        for status in statuses {
            out.extend(self.list_projects(Some(*status))?);
        }
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    /// Rows that currently own a worker (`processing` and `timing_out`).
    pub fn get_active_projects(&self) -> Result<Vec<Project>> {
        self.projects_in(&[ProjectStatus::Processing, ProjectStatus::TimingOut])
    }

    pub fn get_queue_status(&self) -> Result<QueueCounts> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM project_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, count) = row?;
            match status.parse::<ProjectStatus>() {
                Ok(status) => {
                    counts.by_status.insert(status, count.max(0) as u64);
                }
                Err(e) => slog_warn!("get_queue_status: {}", e),
            }
        }
        Ok(counts)
    }

    /// Counts of rows enqueued at or after `since`, per status.
    pub fn counts_since(&self, since: DateTime<Utc>) -> Result<QueueCounts> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM project_queue
             WHERE enqueued_at >= ?1 OR completed_at >= ?1
             GROUP BY status",
        )?;
        let rows = stmt.query_map(params![format_ts(&since)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, count) = row?;
            if let Ok(status) = status.parse::<ProjectStatus>() {
                counts.by_status.insert(status, count.max(0) as u64);
            }
        }
        Ok(counts)
    }

    /// Delete completed and failed rows older than `days`.
    pub fn cleanup_old(&self, days: u32) -> Result<usize> {
        self.cleanup_old_at(days, Utc::now())
    }

    pub fn cleanup_old_at(&self, days: u32, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_ts(&(now - ChronoDuration::days(i64::from(days))));
        let deleted = self.store.conn().execute(
            "DELETE FROM project_queue
             WHERE status IN ('completed', 'failed')
               AND COALESCE(completed_at, enqueued_at) < ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            slog!("Removed {} finished projects older than {} days", deleted, days);
        }
        Ok(deleted)
    }

    /// Delete one row. Rows with a live worker must be recovered or failed first.
    pub fn remove_project(&self, id: i64) -> Result<bool> {
        let removed = self.immediate(|tx| {
            let Some(project) = select_project(tx, id)? else {
                return Ok(false);
            };
            if project.status.is_active() {
                return Err(Error::Validation(format!(
                    "project {} is {}; stop it before removing",
                    id, project.status
                )));
            }
            tx.execute("DELETE FROM project_queue WHERE id = ?1", params![id])?;
            Ok(true)
        })?;
        if removed {
            slog!("Removed project {}", id);
        }
        Ok(removed)
    }

    /// Put a row back in the queue, clearing everything a previous run left.
    ///
    /// Callers hold the project lock around this.
    pub fn reset_project(&self, id: i64) -> Result<Project> {
        let project = self.immediate(|tx| {
            let current = select_project(tx, id)?.ok_or(Error::ProjectNotFound(id))?;
            if !can_reset(current.status) {
                return Err(Error::InvalidTransition {
                    id,
                    from: current.status.to_string(),
                    to: ProjectStatus::Queued.to_string(),
                });
            }
            tx.execute(
                "UPDATE project_queue SET
                    status = 'queued', started_at = NULL, completed_at = NULL,
                    error_message = NULL, session_name = NULL, main_session = NULL,
                    orchestrator_session = NULL, process_pid = NULL
                 WHERE id = ?1 AND status = ?2",
                params![id, current.status.as_str()],
            )?;
            select_project(tx, id)?.ok_or(Error::ProjectNotFound(id))
        })?;
        slog!("Reset project {} to queued", id);
        Ok(project)
    }

    /// Record the merge outcome of a completed project.
    pub fn set_merged_status(&self, id: i64, merged: MergedStatus) -> Result<()> {
        self.immediate(|tx| {
            let current = select_project(tx, id)?.ok_or(Error::ProjectNotFound(id))?;
            if current.status != ProjectStatus::Completed {
                return Err(Error::Validation(format!(
                    "project {} is {}; merge status applies to completed projects",
                    id, current.status
                )));
            }
            tx.execute(
                "UPDATE project_queue SET merged_status = ?1 WHERE id = ?2",
                params![merged.as_str(), id],
            )?;
            Ok(())
        })?;
        slog!("Project {} merge status: {}", id, merged);
        Ok(())
    }

    /// Record launch evidence (session name and worker pid) without changing status.
    pub fn attach_session(&self, id: i64, session_name: &str, pid: Option<u32>) -> Result<()> {
        self.immediate(|tx| {
            let current = select_project(tx, id)?.ok_or(Error::ProjectNotFound(id))?;
            if !matches!(
                current.status,
                ProjectStatus::Processing | ProjectStatus::TimingOut | ProjectStatus::Recovered
            ) {
                return Err(Error::Validation(format!(
                    "project {} is {}; cannot attach a session",
                    id, current.status
                )));
            }
            tx.execute(
                "UPDATE project_queue
                 SET session_name = ?1, process_pid = COALESCE(?2, process_pid)
                 WHERE id = ?3",
                params![session_name, pid, id],
            )?;
            Ok(())
        })?;
        slog_debug!("Project {} attached to session {} pid {:?}", id, session_name, pid);
        Ok(())
    }

    /// Record the main and orchestrator sessions a worker spawned for itself.
    pub fn set_auxiliary_sessions(
        &self,
        id: i64,
        main_session: Option<&str>,
        orchestrator_session: Option<&str>,
    ) -> Result<()> {
        let changed = self.store.conn().execute(
            "UPDATE project_queue SET
                main_session = COALESCE(?1, main_session),
                orchestrator_session = COALESCE(?2, orchestrator_session)
             WHERE id = ?3",
            params![main_session, orchestrator_session, id],
        )?;
        if changed == 0 {
            return Err(Error::ProjectNotFound(id));
        }
        Ok(())
    }
}

fn select_project(tx: &Transaction<'_>, id: i64) -> Result<Option<Project>> {
    let project = tx
        .query_row(
            &format!("SELECT {} FROM project_queue WHERE id = ?1", PROJECT_COLUMNS),
            params![id],
            Project::from_row,
        )
        .optional()?;
    Ok(project)
}
