//! Phantom and husk detection for claimed projects.
//!
//! A row in `processing` or `timing_out` is only trusted while something backs it: a live
//! worker pid whose command line still looks like the worker, or a session on
//! the host. Rows past the grace windows with neither are phantoms and fail.
//! Rows whose session survives but only shows a bare shell are zombies; they
//! fail on the following sweep. A `timing_out` husk fails at once, since its
//! runtime is nearly spent anyway.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::config::Config;
use crate::events::{EventDispatcher, EventType};
use crate::process::ProcessInspector;
use crate::queue::{Project, ProjectStatus, QueueManager, StatusUpdate};
use crate::tmux::SessionHost;
use crate::util::elapsed_between;
use crate::{slog, slog_debug, slog_warn, Error, Result};

/// Foreground commands that mean "nothing is running in this pane".
const BARE_SHELLS: &[&str] = &["bash", "zsh", "sh", "fish", "dash", "ksh", "tcsh", "csh"];

#[derive(Debug, Clone)]
pub struct SessionMonitorConfig {
    pub startup_grace: Duration,
    pub phantom_grace: Duration,
    /// Substring expected in a live worker's command line.
    pub worker_marker: String,
    /// Newly created sessions are assumed alive for this long.
    pub liveness_grace: Duration,
    pub min_windows: usize,
    /// Windows that must run something other than a shell. Empty means all.
    pub critical_windows: Vec<String>,
    pub session_prefix: String,
}

impl SessionMonitorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            startup_grace: config.startup_grace(),
            phantom_grace: config.phantom_grace(),
            worker_marker: worker_marker(&config.worker_command),
            liveness_grace: config.startup_grace(),
            min_windows: 1,
            critical_windows: Vec::new(),
            session_prefix: config.session_prefix.clone(),
        }
    }
}

/// File name of the worker executable, used to recognise worker processes.
pub fn worker_marker(worker_command: &str) -> String {
    let program = worker_command.split_whitespace().next().unwrap_or_default();
    std::path::Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

/// Result of a deep session check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    pub alive: bool,
    pub reason: String,
}

impl Liveness {
    fn alive(reason: impl Into<String>) -> Self {
        Self {
            alive: true,
            reason: reason.into(),
        }
    }

    fn dead(reason: impl Into<String>) -> Self {
        Self {
            alive: false,
            reason: reason.into(),
        }
    }
}

/// What backs a claimed row right now.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Backing {
    Alive(String),
    /// Session exists but nothing is running in it.
    Husk(String),
    Gone(String),
}

pub struct SessionMonitor {
    queue: Arc<QueueManager>,
    host: Arc<dyn SessionHost>,
    inspector: Arc<dyn ProcessInspector>,
    events: Arc<EventDispatcher>,
    config: SessionMonitorConfig,
}

impl SessionMonitor {
    pub fn new(
        queue: Arc<QueueManager>,
        host: Arc<dyn SessionHost>,
        inspector: Arc<dyn ProcessInspector>,
        events: Arc<EventDispatcher>,
        config: SessionMonitorConfig,
    ) -> Self {
        Self {
            queue,
            host,
            inspector,
            events,
            config,
        }
    }

    /// Fail every claimed row that nothing backs any more.
    pub fn detect_and_reset_phantom_projects(&self) -> Result<usize> {
        self.sweep_at(Utc::now())
    }

    /// One sweep as of `now`. Returns how many rows changed status.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let threshold = self.config.startup_grace.max(self.config.phantom_grace);
        // Zombies flagged by an earlier sweep are resolved before new ones
        // are flagged, so every zombie gets one sweep interval of grace.
        let zombies = self.queue.list_projects(Some(ProjectStatus::Zombie))?;
        let mut claimed = self.queue.list_projects(Some(ProjectStatus::Processing))?;
        claimed.extend(self.queue.list_projects(Some(ProjectStatus::TimingOut))?);
        let mut changed = 0;

        for project in zombies {
            for session in project.sessions() {
                if let Err(e) = self.host.kill_session(session) {
                    slog_warn!("Failed to kill husk session {}: {}", session, e);
                }
            }
            if self.transition(
                &project,
                ProjectStatus::Failed,
                "zombie: session had no running worker",
            ) {
                changed += 1;
            }
        }

        for project in claimed {
            let started = project.started_at.unwrap_or(project.enqueued_at);
            let elapsed = elapsed_between(&started, &now);
            if elapsed < threshold {
                slog_debug!(
                    "Project {} within grace ({:?} < {:?})",
                    project.id,
                    elapsed,
                    threshold
                );
                continue;
            }

            match self.backing(&project, now) {
                Backing::Alive(reason) => {
                    slog_debug!("Project {} alive: {}", project.id, reason);
                }
                Backing::Husk(reason) => {
                    slog_warn!("Project {} session is a husk: {}", project.id, reason);
                    let to = if project.status == ProjectStatus::TimingOut {
                        ProjectStatus::Failed
                    } else {
                        ProjectStatus::Zombie
                    };
                    if self.transition(&project, to, &format!("zombie: {}", reason)) {
                        changed += 1;
                        self.events.dispatch(
                            EventType::ZombieDetected,
                            self.payload(&project, elapsed, &reason),
                        );
                    }
                }
                Backing::Gone(reason) => {
                    slog_warn!(
                        "Phantom project {} after {}m: {}",
                        project.id,
                        elapsed.as_secs() / 60,
                        reason
                    );
                    let notes = format!(
                        "phantom: no live worker after {}m ({})",
                        elapsed.as_secs() / 60,
                        reason
                    );
                    if self.transition(&project, ProjectStatus::Failed, &notes) {
                        changed += 1;
                        self.events.dispatch(
                            EventType::PhantomDetected,
                            self.payload(&project, elapsed, &reason),
                        );
                    }
                }
            }
        }

        if changed > 0 {
            slog!("Session sweep changed {} projects", changed);
        }
        Ok(changed)
    }

    fn payload(&self, project: &Project, elapsed: Duration, reason: &str) -> serde_json::Value {
        json!({
            "project_id": project.id,
            "spec_path": project.spec_path,
            "session_name": project.session_name,
            "pid": project.process_pid,
            "elapsed_secs": elapsed.as_secs(),
            "reason": reason,
        })
    }

    /// Apply a status change, tolerating a row that moved underneath us.
    fn transition(&self, project: &Project, to: ProjectStatus, notes: &str) -> bool {
        match self
            .queue
            .update_status(project.id, to, StatusUpdate::default().notes(notes))
        {
            Ok(_) => true,
            Err(Error::InvalidTransition { from, .. }) => {
                slog_debug!(
                    "Project {} moved to {} concurrently, skipping",
                    project.id,
                    from
                );
                false
            }
            Err(e) => {
                slog_warn!("Failed to mark project {} {}: {}", project.id, to, e);
                false
            }
        }
    }

    fn backing(&self, project: &Project, now: DateTime<Utc>) -> Backing {
        if let Some(pid) = project.process_pid {
            match self.inspector.process(pid) {
                Some(info) if info.is_running() => {
                    if self.config.worker_marker.is_empty()
                        || info.command_line().contains(&self.config.worker_marker)
                    {
                        return Backing::Alive(format!("worker pid {} running", pid));
                    }
                    slog_debug!(
                        "Project {} pid {} runs '{}', not a worker; checking sessions",
                        project.id,
                        pid,
                        info.command_line()
                    );
                }
                _ => slog_debug!("Project {} pid {} is gone", project.id, pid),
            }
        }

        let mut husk = None;
        for session in project.sessions() {
            if !self.host.session_exists(session) {
                continue;
            }
            let liveness = self.liveness_at(session, self.config.liveness_grace, now);
            if liveness.alive {
                return Backing::Alive(format!("session {}: {}", session, liveness.reason));
            }
            husk = Some(format!("session {}: {}", session, liveness.reason));
        }
        if let Some(reason) = husk {
            return Backing::Husk(reason);
        }

        match (project.process_pid, &project.session_name) {
            (None, None) => Backing::Gone("no pid or session was ever recorded".to_string()),
            _ => Backing::Gone("worker pid and sessions are gone".to_string()),
        }
    }

    /// Deep check that a session is doing work, not just existing.
    pub fn validate_session_liveness(&self, session: &str, grace: Duration) -> Liveness {
        self.liveness_at(session, grace, Utc::now())
    }

    fn liveness_at(&self, session: &str, grace: Duration, now: DateTime<Utc>) -> Liveness {
        if !self.host.session_exists(session) {
            return Liveness::dead("session does not exist");
        }

        let created = self
            .host
            .list_sessions()
            .ok()
            .and_then(|all| all.into_iter().find(|s| s.name == session))
            .and_then(|s| s.created);
        if let Some(created) = created {
            if elapsed_between(&created, &now) < grace {
                return Liveness::alive("within startup grace");
            }
        }

        let windows = match self.host.list_windows(session) {
            Ok(windows) => windows,
            Err(e) => return Liveness::dead(format!("cannot list windows: {}", e)),
        };
        if windows.len() < self.config.min_windows {
            return Liveness::dead(format!(
                "{} windows, expected at least {}",
                windows.len(),
                self.config.min_windows
            ));
        }

        let critical: Vec<_> = windows
            .iter()
            .filter(|w| {
                self.config.critical_windows.is_empty()
                    || self.config.critical_windows.contains(&w.name)
            })
            .collect();
        if critical.is_empty() {
            return Liveness::dead("no critical windows present");
        }
        match critical.iter().find(|w| !is_bare_shell(&w.current_command)) {
            Some(w) => Liveness::alive(format!("window {} running {}", w.name, w.current_command)),
            None => Liveness::dead("all critical windows are at a bare shell prompt"),
        }
    }

    /// Backfill `session_name` on claimed rows whose expected session exists.
    ///
    /// Covers a worker that came up after the launcher gave up waiting for it.
    pub fn sync_session_state(&self) -> Result<usize> {
        let mut repaired = 0;
        for project in self.queue.get_active_projects()? {
            if project.session_name.is_some() {
                continue;
            }
            let expected = format!("{}{}", self.config.session_prefix, project.id);
            if !self.host.session_exists(&expected) {
                continue;
            }
            let pid = self.host.pane_pid(&expected).ok().flatten();
            match self.queue.attach_session(project.id, &expected, pid) {
                Ok(()) => {
                    slog!("Attached project {} to session {}", project.id, expected);
                    repaired += 1;
                }
                Err(e) => slog_warn!("Failed to attach project {}: {}", project.id, e),
            }
        }
        Ok(repaired)
    }
}

fn is_bare_shell(command: &str) -> bool {
    let command = command.trim().trim_start_matches('-');
    command.is_empty() || BARE_SHELLS.contains(&command)
}
