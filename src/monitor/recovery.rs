//! Reboot recovery and manual project recovery.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::events::{EventDispatcher, EventType};
use crate::lock::{with_project_lock, ProjectLocks};
use crate::process::ProcessInspector;
use crate::queue::{state, Project, ProjectStatus, QueueManager, StatusUpdate};
use crate::tmux::SessionHost;
use crate::{slog, slog_debug, slog_warn, Error, Result};

const PROJECT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// Pane lines kept with a recovery event.
const CAPTURE_LINES: u16 = 40;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Uptime below this means the host rebooted recently.
    pub reboot_uptime_threshold: Duration,
    /// Minimum spacing between reboot-recovery runs.
    pub cooldown: Duration,
    /// Claimed rows running longer than this are reported as needing recovery.
    pub stale_after: Duration,
    pub session_prefix: String,
}

impl RecoveryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reboot_uptime_threshold: Duration::from_secs(config.reboot_uptime_threshold_secs),
            cooldown: Duration::from_secs(config.recovery_cooldown_secs),
            stale_after: config.max_runtime(),
            session_prefix: config.session_prefix.clone(),
        }
    }
}

/// What a reboot-recovery call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebootRecovery {
    /// False when skipped by the cooldown.
    pub ran: bool,
    pub reboot_detected: bool,
    pub reset_projects: Vec<i64>,
    pub sessions_killed: Vec<String>,
}

/// A row that an operator (or automation) should look at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryCandidate {
    pub project: Project,
    pub reason: String,
}

pub struct RecoveryManager {
    queue: Arc<QueueManager>,
    host: Arc<dyn SessionHost>,
    inspector: Arc<dyn ProcessInspector>,
    events: Arc<EventDispatcher>,
    locks: Arc<ProjectLocks>,
    config: RecoveryConfig,
    last_reboot_check: Mutex<Option<Instant>>,
}

impl RecoveryManager {
    pub fn new(
        queue: Arc<QueueManager>,
        host: Arc<dyn SessionHost>,
        inspector: Arc<dyn ProcessInspector>,
        events: Arc<EventDispatcher>,
        locks: Arc<ProjectLocks>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            queue,
            host,
            inspector,
            events,
            locks,
            config,
            last_reboot_check: Mutex::new(None),
        }
    }

    /// After a recent boot, fail every interrupted row and clear leftover
    /// sessions. Rate-limited by the cooldown so repeated calls are no-ops.
    pub fn recover_from_reboot(&self) -> Result<RebootRecovery> {
        {
            let mut last = self
                .last_reboot_check
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < self.config.cooldown {
                    slog_debug!("Reboot recovery skipped (cooldown)");
                    return Ok(RebootRecovery::default());
                }
            }
            *last = Some(Instant::now());
        }

        let uptime = self.inspector.uptime();
        let mut outcome = RebootRecovery {
            ran: true,
            ..Default::default()
        };
        if uptime >= self.config.reboot_uptime_threshold {
            slog_debug!("Uptime {:?}, no reboot recovery needed", uptime);
            return Ok(outcome);
        }
        outcome.reboot_detected = true;
        slog!("Host booted {:?} ago, recovering interrupted projects", uptime);

        let notes = format!("interrupted by host reboot (uptime {}s)", uptime.as_secs());
        for project in self.queue.get_active_projects()? {
            match self.queue.update_status(
                project.id,
                ProjectStatus::Failed,
                StatusUpdate::default().notes(notes.clone()),
            ) {
                Ok(_) => outcome.reset_projects.push(project.id),
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => slog_warn!("Failed to reset project {}: {}", project.id, e),
            }
        }

        // Nothing survives a reboot, so every prefixed session is stale.
        for session in self.host.list_sessions()? {
            if !session.name.starts_with(&self.config.session_prefix) {
                continue;
            }
            match self.host.kill_session(&session.name) {
                Ok(()) => outcome.sessions_killed.push(session.name),
                Err(e) => slog_warn!("Failed to kill session {}: {}", session.name, e),
            }
        }

        slog!(
            "Reboot recovery: {} projects failed, {} sessions killed",
            outcome.reset_projects.len(),
            outcome.sessions_killed.len()
        );
        self.events.dispatch(
            EventType::RebootRecovered,
            json!({
                "uptime_secs": uptime.as_secs(),
                "reset_projects": outcome.reset_projects,
                "sessions_killed": outcome.sessions_killed,
            }),
        );
        Ok(outcome)
    }

    /// Kill whatever backs the row and mark it `recovered`.
    ///
    /// Returns `Ok(false)` when the row is in a state that cannot be
    /// recovered (queued, completed, already recovered).
    pub fn recover_project(&self, project_id: i64, reason: &str) -> Result<bool> {
        with_project_lock(&self.locks, project_id, PROJECT_LOCK_TIMEOUT, || {
            let project = self
                .queue
                .get_project(project_id)?
                .ok_or(Error::ProjectNotFound(project_id))?;
            if !state::can_recover(project.status) {
                slog_warn!(
                    "Project {} is {}, cannot recover",
                    project_id,
                    project.status
                );
                return Ok(false);
            }

            // Keep the worker's last screen for whoever investigates.
            let last_output = project
                .session_name
                .as_deref()
                .filter(|session| self.host.session_exists(session))
                .and_then(|session| match self.host.capture_pane(session, CAPTURE_LINES) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        slog_debug!("Could not capture {}: {}", session, e);
                        None
                    }
                });

            for session in project.sessions() {
                if let Err(e) = self.host.kill_session(session) {
                    slog_warn!("Failed to kill session {}: {}", session, e);
                }
            }
            if let Some(pid) = project.process_pid {
                if self.inspector.is_alive(pid) {
                    self.inspector.kill(pid);
                }
            }

            self.queue.update_status(
                project_id,
                ProjectStatus::Recovered,
                StatusUpdate::default().notes(format!("recovered: {}", reason)),
            )?;
            slog!("Recovered project {} ({})", project_id, reason);
            self.events.dispatch(
                EventType::ProjectRecovered,
                json!({
                    "project_id": project_id,
                    "previous_status": project.status,
                    "reason": reason,
                    "last_output": last_output,
                }),
            );
            Ok(true)
        })
    }

    pub fn check_recovery_needed(&self) -> Result<Vec<RecoveryCandidate>> {
        self.check_recovery_needed_at(Utc::now())
    }

    /// Rows that look stuck: zombies, timing-out rows, and claimed rows
    /// running past the stale ceiling.
    pub fn check_recovery_needed_at(&self, now: DateTime<Utc>) -> Result<Vec<RecoveryCandidate>> {
        let mut candidates = Vec::new();
        let rows = self.queue.projects_in(&[
            ProjectStatus::Processing,
            ProjectStatus::TimingOut,
            ProjectStatus::Zombie,
        ])?;
        for project in rows {
            let reason = match project.status {
                ProjectStatus::Zombie => Some("session has no running worker".to_string()),
                ProjectStatus::TimingOut => Some("approaching max runtime".to_string()),
                _ => project
                    .runtime_at(now)
                    .filter(|runtime| *runtime > self.config.stale_after)
                    .map(|runtime| format!("running for {}m", runtime.as_secs() / 60)),
            };
            if let Some(reason) = reason {
                candidates.push(RecoveryCandidate { project, reason });
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessInfo;
    use crate::store::Store;
    use crate::testing::{FakeProcessInspector, FakeSessionHost};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        queue: Arc<QueueManager>,
        host: Arc<FakeSessionHost>,
        inspector: Arc<FakeProcessInspector>,
        events: Arc<EventDispatcher>,
        recovery: RecoveryManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(QueueManager::new(Arc::new(Store::open_in_memory().unwrap())));
        let inspector = Arc::new(FakeProcessInspector::new());
        let host = Arc::new(FakeSessionHost::new());
        let locks = Arc::new(ProjectLocks::new(&dir.path().join("locks")).unwrap());
        let events = Arc::new(EventDispatcher::new());
        let recovery = RecoveryManager::new(
            queue.clone(),
            host.clone(),
            inspector.clone(),
            events.clone(),
            locks,
            RecoveryConfig {
                reboot_uptime_threshold: Duration::from_secs(600),
                cooldown: Duration::from_secs(300),
                stale_after: Duration::from_secs(3600),
                session_prefix: "spool_".to_string(),
            },
        );
        Fixture {
            _dir: dir,
            queue,
            host,
            inspector,
            events,
            recovery,
        }
    }

    #[test]
    fn test_no_reboot_leaves_rows() {
        let f = fixture();
        f.queue.enqueue("a.md", None, 5).unwrap();
        f.queue.claim_next().unwrap();
        let outcome = f.recovery.recover_from_reboot().unwrap();
        assert!(outcome.ran);
        assert!(!outcome.reboot_detected);
        assert_eq!(f.queue.get_active_projects().unwrap().len(), 1);
    }

    #[test]
    fn test_reboot_fails_active_rows_and_kills_sessions() {
        let f = fixture();
        f.inspector.set_uptime(Duration::from_secs(120));
        let a = f.queue.enqueue("a.md", None, 5).unwrap().unwrap();
        let waiting = f.queue.enqueue("b.md", None, 5).unwrap().unwrap();
        f.queue.claim_next().unwrap();
        f.host.add_session("spool_1", None, "claude");
        f.host.add_session("personal", None, "vim");

        let outcome = f.recovery.recover_from_reboot().unwrap();
        assert!(outcome.reboot_detected);
        assert_eq!(outcome.reset_projects, vec![a]);
        assert_eq!(outcome.sessions_killed, vec!["spool_1".to_string()]);
        assert!(f.host.session_exists("personal"));
        let project = f.queue.get_project(a).unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert!(project.error_message.unwrap().contains("reboot"));
        assert_eq!(
            f.queue.get_project(waiting).unwrap().unwrap().status,
            ProjectStatus::Queued
        );
    }

    #[test]
    fn test_reboot_recovery_cooldown() {
        let f = fixture();
        f.inspector.set_uptime(Duration::from_secs(120));
        assert!(f.recovery.recover_from_reboot().unwrap().ran);

        f.queue.enqueue("a.md", None, 5).unwrap();
        f.queue.claim_next().unwrap();
        let second = f.recovery.recover_from_reboot().unwrap();
        assert!(!second.ran);
        assert_eq!(f.queue.get_active_projects().unwrap().len(), 1);
    }

    #[test]
    fn test_recover_project_kills_backing_and_marks_recovered() {
        let f = fixture();
        let id = f.queue.enqueue("a.md", None, 5).unwrap().unwrap();
        f.queue.claim_next().unwrap();
        f.host.add_session("spool_1", None, "claude");
        f.host.set_output("spool_1", "step 1\nstep 2\nwaiting for input");
        f.inspector.add(ProcessInfo::new(300, &["claude"]));
        f.queue.attach_session(id, "spool_1", Some(300)).unwrap();
        f.queue
            .update_status(id, ProjectStatus::TimingOut, StatusUpdate::default())
            .unwrap();

        assert!(f.recovery.recover_project(id, "operator request").unwrap());
        assert!(!f.host.session_exists("spool_1"));
        assert!(!f.inspector.is_alive(300));
        let project = f.queue.get_project(id).unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Recovered);
        assert_eq!(
            project.error_message.as_deref(),
            Some("recovered: operator request")
        );
        let event = &f.events.history(1)[0];
        assert_eq!(event.event_type, EventType::ProjectRecovered);
        assert_eq!(event.data["previous_status"], "timing_out");
        assert_eq!(
            event.data["last_output"],
            "step 1\nstep 2\nwaiting for input"
        );
    }

    #[test]
    fn test_recover_project_rejects_illegal_states() {
        let f = fixture();
        let id = f.queue.enqueue("a.md", None, 5).unwrap().unwrap();
        assert!(!f.recovery.recover_project(id, "x").unwrap());
        assert!(matches!(
            f.recovery.recover_project(404, "x").unwrap_err(),
            Error::ProjectNotFound(404)
        ));
    }

    #[test]
    fn test_check_recovery_needed() {
        let f = fixture();
        let stale = f.queue.enqueue("a.md", None, 5).unwrap().unwrap();
        let fresh = f.queue.enqueue("b.md", None, 5).unwrap().unwrap();
        f.queue.claim_next().unwrap();
        f.queue.claim_next().unwrap();
        f.queue
            .update_status(fresh, ProjectStatus::Zombie, StatusUpdate::default())
            .unwrap();

        let now = Utc::now();
        let candidates = f.recovery.check_recovery_needed_at(now).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].project.id, fresh);

        let later = now + chrono::Duration::hours(2);
        let ids: Vec<_> = f
            .recovery
            .check_recovery_needed_at(later)
            .unwrap()
            .into_iter()
            .map(|c| c.project.id)
            .collect();
        assert_eq!(ids, vec![stale, fresh]);
    }
}
