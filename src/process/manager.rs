//! Registry of worker processes launched by this scheduler.
//!
//! The manager only tracks and kills; it never touches the queue. Callers
//! (the process monitor actor) turn a [`MonitorReport`] into status changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::util::elapsed_between;
use crate::{slog, slog_debug, slog_warn};

use super::ProcessInspector;

const KILL_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(5);
/// Fraction of `max_runtime` after which a worker is reported as timing out.
const WARN_FRACTION: f64 = 0.9;

/// One tracked worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedProcess {
    pub project_id: i64,
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub warned: bool,
}

/// Outcome of one monitoring pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Tracked processes found dead and untracked.
    pub dead: Vec<i64>,
    /// Processes past 90% of the runtime ceiling (reported once each).
    pub timing_out: Vec<i64>,
    /// Processes killed for exceeding the ceiling.
    pub killed: Vec<i64>,
}

impl MonitorReport {
    pub fn is_empty(&self) -> bool {
        self.dead.is_empty() && self.timing_out.is_empty() && self.killed.is_empty()
    }
}

pub struct ProcessManager {
    inspector: Arc<dyn ProcessInspector>,
    tracked: Mutex<HashMap<i64, TrackedProcess>>,
    max_runtime: Duration,
    term_grace: Duration,
}

impl ProcessManager {
    pub fn new(inspector: Arc<dyn ProcessInspector>, max_runtime: Duration) -> Self {
        Self {
            inspector,
            tracked: Mutex::new(HashMap::new()),
            max_runtime,
            term_grace: DEFAULT_TERM_GRACE,
        }
    }

    /// How long `kill` waits after SIGTERM before escalating.
    pub fn with_term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }

    pub fn max_runtime(&self) -> Duration {
        self.max_runtime
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<i64, TrackedProcess>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, project_id: i64, pid: u32, command: &str) {
        self.register_started(project_id, pid, command, Utc::now());
    }

    /// Track a worker that started at `started_at` (used when a restarted
    /// daemon adopts workers from the store).
    pub fn register_started(
        &self,
        project_id: i64,
        pid: u32,
        command: &str,
        started_at: DateTime<Utc>,
    ) {
        slog_debug!(
            "Tracking project {} pid {} ({})",
            project_id,
            pid,
            command
        );
        self.tracked().insert(
            project_id,
            TrackedProcess {
                project_id,
                pid,
                command: command.to_string(),
                started_at,
                warned: false,
            },
        );
    }

    pub fn untrack(&self, project_id: i64) -> Option<TrackedProcess> {
        self.tracked().remove(&project_id)
    }

    pub fn get(&self, project_id: i64) -> Option<TrackedProcess> {
        self.tracked().get(&project_id).cloned()
    }

    pub fn tracked_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.tracked().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// True only for a tracked project whose pid is present and not a zombie.
    pub fn is_alive(&self, project_id: i64) -> bool {
        let Some(pid) = self.tracked().get(&project_id).map(|p| p.pid) else {
            return false;
        };
        self.inspector.is_alive(pid)
    }

    /// Stop a tracked worker and forget it.
    ///
    /// Graceful kills send SIGTERM and wait up to the term grace before
    /// escalating. Returns whether the process is gone afterwards; killing an
    /// already-dead process reports `true`, an untracked project `false`.
    pub fn kill(&self, project_id: i64, force: bool, reason: &str) -> bool {
        let Some(process) = self.untrack(project_id) else {
            slog_debug!("kill: project {} is not tracked", project_id);
            return false;
        };
        let pid = process.pid;
        if !self.inspector.is_alive(pid) {
            slog_debug!("kill: project {} pid {} already gone", project_id, pid);
            return true;
        }

        slog!(
            "Killing project {} pid {} ({}{})",
            project_id,
            pid,
            reason,
            if force { ", forced" } else { "" }
        );
        if !force {
            self.inspector.terminate(pid);
            let mut waited = Duration::ZERO;
            while waited < self.term_grace {
                if !self.inspector.is_alive(pid) {
                    return true;
                }
                std::thread::sleep(KILL_POLL);
                waited += KILL_POLL;
            }
            slog_warn!(
                "Project {} pid {} ignored SIGTERM for {:?}, escalating",
                project_id,
                pid,
                self.term_grace
            );
        }
        self.inspector.kill(pid);
        let gone = !self.inspector.is_alive(pid);
        if !gone {
            slog_warn!("Project {} pid {} survived SIGKILL", project_id, pid);
        }
        gone
    }

    /// Untrack every process that has exited. Returns their project ids.
    pub fn reap_dead(&self) -> Vec<i64> {
        let snapshot: Vec<(i64, u32)> = self
            .tracked()
            .values()
            .map(|p| (p.project_id, p.pid))
            .collect();
        let mut dead = Vec::new();
        for (project_id, pid) in snapshot {
            if !self.inspector.is_alive(pid) {
                self.untrack(project_id);
                dead.push(project_id);
            }
        }
        if !dead.is_empty() {
            slog!("Workers exited for projects {:?}", dead);
        }
        dead.sort_unstable();
        dead
    }

    pub fn check_processes(&self) -> MonitorReport {
        self.check_processes_at(Utc::now())
    }

    /// One monitoring pass: reap the dead, flag workers near the ceiling and
    /// hard-kill the ones past it.
    pub fn check_processes_at(&self, now: DateTime<Utc>) -> MonitorReport {
        let mut report = MonitorReport {
            dead: self.reap_dead(),
            ..Default::default()
        };
        if self.max_runtime.is_zero() {
            return report;
        }

        let warn_after = self.max_runtime.mul_f64(WARN_FRACTION);
        let snapshot: Vec<TrackedProcess> = self.tracked().values().cloned().collect();
        for process in snapshot {
            let runtime = elapsed_between(&process.started_at, &now);
            if runtime > self.max_runtime {
                slog_warn!(
                    "Project {} exceeded max runtime ({:?} > {:?})",
                    process.project_id,
                    runtime,
                    self.max_runtime
                );
                self.kill(process.project_id, true, "max runtime exceeded");
                report.killed.push(process.project_id);
            } else if runtime > warn_after && !process.warned {
                if let Some(p) = self.tracked().get_mut(&process.project_id) {
                    p.warned = true;
                }
                report.timing_out.push(process.project_id);
            }
        }
        report.killed.sort_unstable();
        report.timing_out.sort_unstable();
        report
    }

    /// Force-kill everything still tracked.
    pub fn shutdown(&self) {
        let ids = self.tracked_ids();
        if ids.is_empty() {
            return;
        }
        slog!("Stopping {} tracked workers", ids.len());
        for id in ids {
            self.kill(id, true, "scheduler shutdown");
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
