//! Project locks and the scheduler singleton, with each manager standing in
//! for a separate process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use spool::lock::{
    with_project_lock, ProjectLocks, SchedulerLockConfig, SchedulerLockManager,
};
use spool::process::ProcessInfo;
use spool::testing::FakeProcessInspector;
use spool::Error;

use crate::fixtures::TestHome;

fn scheduler_lock(home: &TestHome, pid: u32) -> SchedulerLockManager {
    scheduler_lock_with(home, pid, Arc::new(FakeProcessInspector::new()))
}

fn scheduler_lock_with(
    home: &TestHome,
    pid: u32,
    inspector: Arc<FakeProcessInspector>,
) -> SchedulerLockManager {
    let config = SchedulerLockConfig {
        settle_delay: Duration::ZERO,
        ..Default::default()
    };
    SchedulerLockManager::new(&home.lock_dir(), inspector, config)
        .unwrap()
        .with_store(home.store())
        .with_pid(pid)
}

/// A daemon that just started, as the process table shows it.
fn fresh_daemon(pid: u32) -> ProcessInfo {
    ProcessInfo::new(pid, &["/usr/bin/spool", "daemon"]).started_at(chrono::Utc::now())
}

/// Process B times out while A holds project 7, then gets it at once.
#[test]
fn test_project_lock_blocks_until_released() {
    let home = TestHome::new();
    let a = ProjectLocks::new(&home.lock_dir()).unwrap();
    let b = ProjectLocks::new(&home.lock_dir())
        .unwrap()
        .with_poll_interval(Duration::from_millis(20));

    let guard = a.acquire(7, Duration::ZERO).unwrap().unwrap();
    assert!(b.is_locked(7));

    let start = Instant::now();
    assert!(b.acquire(7, Duration::from_millis(300)).unwrap().is_none());
    assert!(start.elapsed() >= Duration::from_millis(300));

    guard.release();
    let start = Instant::now();
    let reacquired = b.acquire(7, Duration::from_secs(2)).unwrap();
    assert!(reacquired.is_some());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_with_project_lock_reports_timeout() {
    let home = TestHome::new();
    let locks = ProjectLocks::new(&home.lock_dir()).unwrap();
    let _held = locks.acquire(3, Duration::ZERO).unwrap().unwrap();

    let other = ProjectLocks::new(&home.lock_dir()).unwrap();
    let err = with_project_lock(&other, 3, Duration::from_millis(50), || Ok(())).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { id: 3, .. }));

    // Different projects never contend.
    assert_eq!(
        with_project_lock(&other, 4, Duration::ZERO, || Ok(42)).unwrap(),
        42
    );
}

/// Two schedulers: exactly one wins, the loser leaves nothing behind.
#[test]
fn test_scheduler_lock_single_holder() {
    let home = TestHome::new();
    let first = scheduler_lock(&home, 1001);
    let second = scheduler_lock(&home, 1002);

    assert!(first.acquire_lock().unwrap());
    assert!(!second.acquire_lock().unwrap());
    assert!(!second.is_held());
    assert_eq!(second.read_holder().unwrap().pid, 1001);

    let recorded = home.store().lock_holder("scheduler").unwrap().unwrap();
    assert_eq!(recorded.holder_pid, 1001);

    first.release_lock();
    assert!(!first.lock_path().exists());
    assert!(!first.info_path().exists());
    assert!(home.store().lock_holder("scheduler").unwrap().is_none());

    // The loser's failed attempt did not block a later legitimate one.
    assert!(second.acquire_lock().unwrap());
    second.release_lock();
}

/// A sibling daemon too young for the first scan still makes the
/// confirming scan back off, leaving no artifacts behind.
#[test]
fn test_scheduler_lock_backs_off_for_racing_sibling() {
    let home = TestHome::new();
    let inspector = Arc::new(FakeProcessInspector::new());
    inspector.add(fresh_daemon(2002));
    let manager = scheduler_lock_with(&home, 2001, inspector);

    assert!(!manager.acquire_lock().unwrap());
    assert!(!manager.is_held());
    assert!(!manager.lock_path().exists());
    assert!(home.store().lock_holder("scheduler").unwrap().is_none());
}

/// Deleting the held lock file must not let a second daemon in.
#[test]
fn test_scheduler_lock_survives_unlinked_file() {
    let home = TestHome::new();
    let inspector = Arc::new(FakeProcessInspector::new());
    inspector.add(fresh_daemon(3001));
    let holder = scheduler_lock_with(&home, 3001, inspector.clone());
    let intruder = scheduler_lock_with(&home, 3002, inspector);

    assert!(holder.acquire_lock().unwrap());
    std::fs::remove_file(holder.lock_path()).unwrap();

    assert!(!intruder.acquire_lock().unwrap());
    assert!(holder.is_held());
    assert!(!intruder.is_held());
    assert_eq!(intruder.read_holder().unwrap().pid, 3001);
    let recorded = home.store().lock_holder("scheduler").unwrap().unwrap();
    assert_eq!(recorded.holder_pid, 3001);

    // Cleanup from another process leaves the live holder's record alone.
    assert!(!intruder.cleanup_stale_artifacts().unwrap());
    assert!(holder.info_path().exists());
}

#[test]
fn test_stale_project_locks_are_cleaned_only_when_free() {
    let home = TestHome::new();
    let locks = ProjectLocks::new(&home.lock_dir()).unwrap();
    let held = locks.acquire(1, Duration::ZERO).unwrap().unwrap();
    std::fs::write(locks.lock_path(2), b"").unwrap();

    let removed = locks.cleanup_stale_locks(Duration::ZERO).unwrap();
    assert_eq!(removed, 1);
    assert!(locks.lock_path(1).exists());
    assert!(!locks.lock_path(2).exists());
    drop(held);
}
