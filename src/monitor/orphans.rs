//! Orphaned session reconciliation.
//!
//! Sessions named `<prefix><id>` that no active row accounts for are left
//! over from crashed schedulers or manual resets. Old enough ones are killed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::json;

use crate::events::{EventDispatcher, EventType};
use crate::queue::{ProjectStatus, QueueManager};
use crate::tmux::SessionHost;
use crate::util::elapsed_between;
use crate::{slog, slog_debug, slog_warn, Error, Result};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    pub killed: Vec<String>,
    /// Orphans not yet old enough to kill.
    pub too_young: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl OrphanReport {
    pub fn killed_count(&self) -> usize {
        self.killed.len()
    }
}

pub struct OrphanReaper {
    queue: Arc<QueueManager>,
    host: Arc<dyn SessionHost>,
    events: Arc<EventDispatcher>,
    pattern: Regex,
    min_age: Duration,
}

impl OrphanReaper {
    pub fn new(
        queue: Arc<QueueManager>,
        host: Arc<dyn SessionHost>,
        events: Arc<EventDispatcher>,
        session_prefix: &str,
        min_age: Duration,
    ) -> Result<Self> {
        let pattern = Regex::new(&format!(r"^{}(\d+)(?:_|$)", regex::escape(session_prefix)))
            .map_err(|e| Error::Validation(format!("bad session prefix: {}", e)))?;
        Ok(Self {
            queue,
            host,
            events,
            pattern,
            min_age,
        })
    }

    /// Project id encoded in a session name, if it is one of ours.
    pub fn project_id_of(&self, session: &str) -> Option<i64> {
        self.pattern
            .captures(session)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    pub fn reap(&self) -> Result<OrphanReport> {
        self.reap_at(Utc::now())
    }

    pub fn reap_at(&self, now: DateTime<Utc>) -> Result<OrphanReport> {
        let owned = self.queue.projects_in(&[
            ProjectStatus::Processing,
            ProjectStatus::TimingOut,
            ProjectStatus::Zombie,
            ProjectStatus::Recovered,
        ])?;
        let owned_ids: HashSet<i64> = owned.iter().map(|p| p.id).collect();
        let owned_sessions: HashSet<String> = owned
            .iter()
            .flat_map(|p| p.sessions().map(str::to_string).collect::<Vec<_>>())
            .collect();

        let mut report = OrphanReport::default();
        for session in self.host.list_sessions()? {
            let Some(project_id) = self.project_id_of(&session.name) else {
                continue;
            };
            if owned_ids.contains(&project_id) || owned_sessions.contains(&session.name) {
                continue;
            }
            // Unknown creation time: leave it for an operator.
            let Some(age) = session.created.map(|c| elapsed_between(&c, &now)) else {
                slog_debug!("Orphan {} has no creation time, skipping", session.name);
                continue;
            };
            if age < self.min_age {
                report.too_young.push(session.name);
                continue;
            }
            match self.host.kill_session(&session.name) {
                Ok(()) => {
                    slog!(
                        "Killed orphaned session {} (project {}, age {}m)",
                        session.name,
                        project_id,
                        age.as_secs() / 60
                    );
                    self.events.dispatch(
                        EventType::OrphanSessionKilled,
                        json!({
                            "session_name": session.name,
                            "project_id": project_id,
                            "age_secs": age.as_secs(),
                        }),
                    );
                    report.killed.push(session.name);
                }
                Err(e) => {
                    slog_warn!("Failed to kill orphan {}: {}", session.name, e);
                    report.failed.push((session.name, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}
