//! Full scheduler ticks: launch, completion reported by a separate
//! connection, crash detection and batch accounting.

use chrono::Utc;

use spool::events::{read_audit_log, EventType};
use spool::queue::{ProjectStatus, StatusUpdate};
use spool::tmux::SessionHost;

use crate::fixtures::TestScheduler;

#[test]
fn test_queue_drains_through_the_loop() {
    let t = TestScheduler::new(1);
    let cli = t.home.queue();
    let a = cli.enqueue("/specs/a.md", Some("/work/a"), 5).unwrap().unwrap();
    let b = cli.enqueue("/specs/b.md", None, 5).unwrap().unwrap();

    t.scheduler.startup().unwrap();
    let first = t.scheduler.tick().unwrap();
    assert_eq!(first.launched, vec![a]);
    let session_a = format!("spool_{}", a);
    assert!(t.host.session_exists(&session_a));
    assert_eq!(
        t.host.session(&session_a).unwrap().command,
        vec!["worker", "--headless", "/specs/a.md", "/work/a"]
    );

    // The worker reports completion through its own connection.
    cli.update_status(a, ProjectStatus::Completed, StatusUpdate::default())
        .unwrap();
    let second = t.scheduler.tick().unwrap();
    assert_eq!(second.finished, vec![a]);
    assert_eq!(second.launched, vec![b]);

    // Worker b dies with its session; the next sweep past the grace fails it.
    let session_b = format!("spool_{}", b);
    t.host.kill_session(&session_b).unwrap();
    let later = Utc::now() + chrono::Duration::hours(2);
    let third = t.scheduler.tick_at(later).unwrap();
    assert_eq!(third.phantoms, Some(1));
    assert_eq!(third.finished, vec![b]);

    let project = cli.get_project(b).unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert!(project.error_message.unwrap().starts_with("phantom"));

    let batch = third.batch.unwrap();
    assert_eq!(batch.completed_batch, Some(1));
}

#[test]
fn test_events_reach_the_audit_log() {
    let t = TestScheduler::new(2);
    t.home
        .queue()
        .enqueue("/specs/a.md", None, 5)
        .unwrap()
        .unwrap();
    t.scheduler.startup().unwrap();
    t.scheduler.tick().unwrap();

    let logged = read_audit_log(&t.home.config.event_log_path().unwrap(), 100).unwrap();
    let kinds: Vec<EventType> = logged.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::SchedulerStarted,
            EventType::ProjectClaimed,
            EventType::ProjectLaunched,
        ]
    );
}

#[test]
fn test_restart_adopts_running_worker() {
    let t = TestScheduler::new(1);
    let id = t
        .home
        .queue()
        .enqueue("/specs/a.md", None, 5)
        .unwrap()
        .unwrap();
    t.scheduler.tick().unwrap();
    let pid = t.scheduler.processes().get(id).unwrap().pid;

    // A second scheduler on the same home and host picks the worker up.
    let restarted = spool::daemon::CoreScheduler::new(
        t.home.config.clone(),
        t.home.store(),
        std::sync::Arc::new(spool::events::EventDispatcher::new()),
        t.host.clone(),
        t.inspector.clone(),
    )
    .unwrap();
    restarted.startup().unwrap();
    assert_eq!(restarted.processes().get(id).unwrap().pid, pid);
    assert!(restarted.tick().unwrap().launched.is_empty());

    // Shutting the new scheduler down stops the adopted worker.
    restarted.shutdown();
    assert!(t.inspector.killed().contains(&pid));
}
