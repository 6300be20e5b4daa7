//! Phantom sweeps, runtime limits and reboot recovery against a file store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use spool::config::Config;
use spool::events::{EventDispatcher, EventType};
use spool::lock::ProjectLocks;
use spool::monitor::{RecoveryConfig, RecoveryManager, SessionMonitor, SessionMonitorConfig};
use spool::process::{ProcessInfo, ProcessManager};
use spool::queue::{ProjectStatus, QueueManager, StatusUpdate};
use spool::testing::{FakeProcessInspector, FakeSessionHost};
use spool::tmux::SessionHost;

use crate::fixtures::TestHome;

struct Monitors {
    home: TestHome,
    queue: Arc<QueueManager>,
    host: Arc<FakeSessionHost>,
    inspector: Arc<FakeProcessInspector>,
    events: Arc<EventDispatcher>,
}

impl Monitors {
    fn new() -> Self {
        let home = TestHome::new();
        let queue = Arc::new(home.queue());
        Self {
            home,
            queue,
            host: Arc::new(FakeSessionHost::new()),
            inspector: Arc::new(FakeProcessInspector::new()),
            events: Arc::new(EventDispatcher::new()),
        }
    }

    fn session_monitor(&self) -> SessionMonitor {
        SessionMonitor::new(
            self.queue.clone(),
            self.host.clone(),
            self.inspector.clone(),
            self.events.clone(),
            SessionMonitorConfig::from_config(&self.home.config),
        )
    }

    fn recovery(&self) -> RecoveryManager {
        RecoveryManager::new(
            self.queue.clone(),
            self.host.clone(),
            self.inspector.clone(),
            self.events.clone(),
            Arc::new(ProjectLocks::new(&self.home.lock_dir()).unwrap()),
            RecoveryConfig::from_config(&self.home.config),
        )
    }

    fn claimed(&self, spec: &str) -> i64 {
        let id = self.queue.enqueue(spec, None, 5).unwrap().unwrap();
        assert_eq!(self.queue.claim_next().unwrap().unwrap().id, id);
        id
    }

    fn count(&self, event_type: EventType) -> usize {
        self.events
            .history(1000)
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

/// A fresh claim is left alone; past the grace windows with nothing backing
/// it, the same row fails once.
#[test]
fn test_phantom_row_fails_after_grace() {
    let m = Monitors::new();
    let id = m.claimed("specs/phantom.md");
    let monitor = m.session_monitor();

    assert_eq!(monitor.sweep_at(Utc::now()).unwrap(), 0);
    assert_eq!(
        m.queue.get_project(id).unwrap().unwrap().status,
        ProjectStatus::Processing
    );

    let config = Config::default();
    let past_grace = Utc::now()
        + chrono::Duration::seconds((config.startup_grace_secs + config.phantom_grace_secs) as i64 + 1);
    assert_eq!(monitor.sweep_at(past_grace).unwrap(), 1);
    assert_eq!(monitor.sweep_at(past_grace).unwrap(), 0);

    let project = m.queue.get_project(id).unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert!(project.error_message.unwrap().starts_with("phantom"));
    assert_eq!(m.count(EventType::PhantomDetected), 1);
}

/// A worker that dies after being warned about its runtime still releases
/// its row to the sweep.
#[test]
fn test_dead_timing_out_row_fails() {
    let m = Monitors::new();
    let id = m.claimed("specs/slow.md");
    m.queue.attach_session(id, "spool_gone", Some(6160)).unwrap();
    m.queue
        .update_status(id, ProjectStatus::TimingOut, StatusUpdate::default())
        .unwrap();

    let later = Utc::now() + chrono::Duration::hours(2);
    assert_eq!(m.session_monitor().sweep_at(later).unwrap(), 1);
    assert_eq!(
        m.queue.get_project(id).unwrap().unwrap().status,
        ProjectStatus::Failed
    );
    assert_eq!(m.queue.get_queue_status().unwrap().active(), 0);
    assert_eq!(m.count(EventType::PhantomDetected), 1);
}

/// A live worker pid keeps a row alive even without a session.
#[test]
fn test_live_worker_is_not_a_phantom() {
    let m = Monitors::new();
    let id = m.claimed("specs/alive.md");
    m.inspector
        .add(ProcessInfo::new(5150, &["worker", "--headless", "specs/alive.md"]));
    m.queue.attach_session(id, "spool_gone", Some(5150)).unwrap();

    let later = Utc::now() + chrono::Duration::hours(2);
    assert_eq!(m.session_monitor().sweep_at(later).unwrap(), 0);
    assert_eq!(
        m.queue.get_project(id).unwrap().unwrap().status,
        ProjectStatus::Processing
    );
}

/// A worker past the ceiling is killed and untracked in one pass.
#[test]
fn test_runtime_limit_kills_worker() {
    let inspector = Arc::new(FakeProcessInspector::new());
    inspector.add(ProcessInfo::new(77, &["worker"]));
    let processes = ProcessManager::new(inspector.clone(), Duration::from_secs(60));
    processes.register_started(1, 77, "worker", Utc::now() - chrono::Duration::minutes(5));

    let report = processes.check_processes();
    assert_eq!(report.killed, vec![1]);
    assert!(!processes.is_alive(1));
    assert!(processes.tracked_ids().is_empty());
    assert_eq!(inspector.killed(), vec![77]);
}

/// Two reboot recoveries inside the cooldown only reset rows once.
#[test]
fn test_reboot_recovery_runs_once_per_cooldown() {
    let m = Monitors::new();
    let a = m.claimed("specs/a.md");
    let b = m.claimed("specs/b.md");
    m.host.add_session("spool_1", Some(Utc::now()), "worker");
    m.host.add_session("notes", Some(Utc::now()), "vim");
    m.inspector.set_uptime(Duration::from_secs(60));

    let recovery = m.recovery();
    let first = recovery.recover_from_reboot().unwrap();
    assert!(first.reboot_detected);
    assert_eq!(first.reset_projects, vec![a, b]);
    assert_eq!(first.sessions_killed, vec!["spool_1".to_string()]);
    assert!(m.host.session_exists("notes"));

    let second = recovery.recover_from_reboot().unwrap();
    assert!(!second.ran);
    assert!(second.reset_projects.is_empty());
    assert_eq!(m.count(EventType::RebootRecovered), 1);

    for id in [a, b] {
        assert_eq!(
            m.queue.get_project(id).unwrap().unwrap().status,
            ProjectStatus::Failed
        );
    }
}

#[test]
fn test_manual_recovery_kills_session_and_marks_recovered() {
    let m = Monitors::new();
    let id = m.claimed("specs/stuck.md");
    m.host.add_session("spool_stuck", Some(Utc::now()), "worker");
    m.queue.attach_session(id, "spool_stuck", None).unwrap();

    let recovery = m.recovery();
    assert!(recovery.recover_project(id, "operator request").unwrap());
    assert!(!m.host.session_exists("spool_stuck"));
    let project = m.queue.get_project(id).unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Recovered);
    assert_eq!(
        project.error_message.as_deref(),
        Some("recovered: operator request")
    );

    // Already recovered: nothing further to do.
    assert!(!recovery.recover_project(id, "again").unwrap());
    assert_eq!(m.count(EventType::ProjectRecovered), 1);
}
