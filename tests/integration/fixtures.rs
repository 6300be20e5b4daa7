//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A temporary spool home with its own database and lock directory
//! - Extra store connections standing in for other processes
//! - A scheduler wired to fake tmux and a fake process table

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use spool::config::Config;
use spool::daemon::CoreScheduler;
use spool::events::EventDispatcher;
use spool::queue::QueueManager;
use spool::store::Store;
use spool::testing::{FakeProcessInspector, FakeSessionHost};

/// A temporary spool home directory.
pub struct TestHome {
    pub temp_dir: TempDir,
    pub config: Config,
}

impl TestHome {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = Config::with_home(temp_dir.path());
        config.worker_command = "worker --headless".to_string();
        config.ensure_dirs().expect("Failed to create spool dirs");
        Self { temp_dir, config }
    }

    pub fn db_path(&self) -> PathBuf {
        self.config.db_path().unwrap()
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.config.lock_dir().unwrap()
    }

    /// A fresh connection to the shared database, as another process would open.
    pub fn store(&self) -> Arc<Store> {
        Arc::new(Store::open(&self.db_path()).expect("Failed to open store"))
    }

    pub fn queue(&self) -> QueueManager {
        QueueManager::new(self.store())
    }
}

/// A scheduler on a [`TestHome`], with every interval set to run each tick.
pub struct TestScheduler {
    pub home: TestHome,
    pub host: Arc<FakeSessionHost>,
    pub inspector: Arc<FakeProcessInspector>,
    pub scheduler: CoreScheduler,
}

impl TestScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let mut home = TestHome::new();
        home.config.max_concurrent = max_concurrent;
        home.config.phantom_check_interval_secs = 0;
        home.config.state_sync_interval_secs = 0;
        home.config.orphan_check_interval_secs = 0;

        let inspector = Arc::new(FakeProcessInspector::new());
        let host = Arc::new(FakeSessionHost::with_processes(inspector.clone()));
        let scheduler = CoreScheduler::new(
            home.config.clone(),
            home.store(),
            Arc::new(EventDispatcher::with_audit_log(
                home.config.event_log_path().unwrap(),
            )),
            host.clone(),
            inspector.clone(),
        )
        .expect("Failed to build scheduler")
        .with_batch_interval(Duration::ZERO);

        Self {
            home,
            host,
            inspector,
            scheduler,
        }
    }
}
