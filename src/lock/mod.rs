//! Cross-process locks: one per project, plus the scheduler singleton.

mod project;
mod scheduler;

pub use project::{with_project_lock, ProjectLockGuard, ProjectLocks};
pub use scheduler::{
    SchedulerLockConfig, SchedulerLockInfo, SchedulerLockManager, SchedulerProcess,
    SCHEDULER_INFO_FILE, SCHEDULER_LOCK_FILE,
};
