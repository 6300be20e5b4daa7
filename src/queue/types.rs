//! Queue row types.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::util::parse_ts;

/// Lifecycle state of a queued project.
///
/// Stored in the `status` column as the snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a scheduler; a worker is (or should be) running
    Processing,
    /// Runtime is close to the ceiling; the worker will be killed soon
    TimingOut,
    /// Worker finished successfully
    Completed,
    /// Worker failed, timed out, or was found dead
    Failed,
    /// Session exists but nothing is running in it
    Zombie,
    /// Manually or automatically recovered; may be resumed
    Recovered,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 7] = [
        ProjectStatus::Queued,
        ProjectStatus::Processing,
        ProjectStatus::TimingOut,
        ProjectStatus::Completed,
        ProjectStatus::Failed,
        ProjectStatus::Zombie,
        ProjectStatus::Recovered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Queued => "queued",
            ProjectStatus::Processing => "processing",
            ProjectStatus::TimingOut => "timing_out",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Zombie => "zombie",
            ProjectStatus::Recovered => "recovered",
        }
    }

    /// Rows that own (or are expected to own) a live worker.
    pub fn is_active(&self) -> bool {
        matches!(self, ProjectStatus::Processing | ProjectStatus::TimingOut)
    }

    /// Rows that block a second enqueue of the same spec file: anything
    /// that may still run or resume.
    pub fn blocks_enqueue(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Failed)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ProjectStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown project status '{}'", s))
    }
}

/// Merge state of a completed project's branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergedStatus {
    #[default]
    Pending,
    Merged,
    Conflict,
    Skipped,
}

impl MergedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergedStatus::Pending => "pending",
            MergedStatus::Merged => "merged",
            MergedStatus::Conflict => "conflict",
            MergedStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for MergedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MergedStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MergedStatus::Pending),
            "merged" => Ok(MergedStatus::Merged),
            "conflict" => Ok(MergedStatus::Conflict),
            "skipped" => Ok(MergedStatus::Skipped),
            other => Err(format!("unknown merged status '{}'", other)),
        }
    }
}

/// One row of `project_queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub spec_path: String,
    pub project_path: Option<String>,
    pub status: ProjectStatus,
    pub priority: i64,
    pub session_name: Option<String>,
    pub main_session: Option<String>,
    pub orchestrator_session: Option<String>,
    pub process_pid: Option<u32>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub merged_status: Option<MergedStatus>,
}

/// Column list matching [`Project::from_row`].
pub(crate) const PROJECT_COLUMNS: &str = "id, spec_path, project_path, status, priority, \
     session_name, main_session, orchestrator_session, process_pid, enqueued_at, \
     started_at, completed_at, error_message, merged_status";

impl Project {
    /// Decode a row selected with [`PROJECT_COLUMNS`].
    ///
    /// Unknown status strings surface as a conversion error rather than being
    /// coerced, so a row written by a newer build is never misread.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let status = status.parse::<ProjectStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?;
        let enqueued_at: String = row.get("enqueued_at")?;
        let enqueued_at = parse_ts(&enqueued_at).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                format!("bad enqueued_at '{}'", enqueued_at).into(),
            )
        })?;
        let optional_ts = |name: &str| -> rusqlite::Result<Option<DateTime<Utc>>> {
            Ok(row
                .get::<_, Option<String>>(name)?
                .as_deref()
                .and_then(parse_ts))
        };
        let merged_status = row
            .get::<_, Option<String>>("merged_status")?
            .and_then(|s| s.parse::<MergedStatus>().ok());

        Ok(Project {
            id: row.get("id")?,
            spec_path: row.get("spec_path")?,
            project_path: row.get("project_path")?,
            status,
            priority: row.get("priority")?,
            session_name: row.get("session_name")?,
            main_session: row.get("main_session")?,
            orchestrator_session: row.get("orchestrator_session")?,
            process_pid: row.get("process_pid")?,
            enqueued_at,
            started_at: optional_ts("started_at")?,
            completed_at: optional_ts("completed_at")?,
            error_message: row.get("error_message")?,
            merged_status,
        })
    }

    /// Every session name recorded against this row.
    pub fn sessions(&self) -> impl Iterator<Item = &str> {
        [
            self.session_name.as_deref(),
            self.main_session.as_deref(),
            self.orchestrator_session.as_deref(),
        ]
        .into_iter()
        .flatten()
    }

    /// Runtime since `started_at`, if the row was ever started.
    pub fn runtime_at(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.started_at
            .map(|start| crate::util::elapsed_between(&start, &now))
    }
}

/// What `claim_next` hands to the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedProject {
    pub id: i64,
    pub spec_path: String,
    pub project_path: Option<String>,
}
