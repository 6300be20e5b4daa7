//! The scheduler daemon.
//!
//! [`CoreScheduler`] is the composition root: it owns the store handle and
//! every component built on it, and [`CoreScheduler::tick`] runs one pass of
//! the coordination loop. [`run_daemon`] wraps that in the singleton lock,
//! the process-monitor actor and signal handling.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::actors::ProcessMonitorActor;
use crate::config::Config;
use crate::events::{EventDispatcher, EventType};
use crate::launcher::WorkerLauncher;
use crate::lock::{ProjectLocks, SchedulerLockConfig, SchedulerLockManager};
use crate::monitor::{
    BatchProcessor, BatchSummary, OrphanReaper, RebootRecovery, RecoveryConfig, RecoveryManager,
    SessionMonitor, SessionMonitorConfig,
};
use crate::process::{ProcessInspector, ProcessManager, SystemInspector};
use crate::queue::{ProjectStatus, QueueManager};
use crate::store::Store;
use crate::tmux::{SessionHost, Tmux};
use crate::util::blocking;
use crate::{slog, slog_debug, slog_error, slog_warn, Error, Result};

/// Pause after a failed tick before the loop resumes.
const ERROR_PAUSE: Duration = Duration::from_secs(5);
/// Unheld project lock files older than this are removed during housekeeping.
const STALE_LOCK_AGE: Duration = Duration::from_secs(60 * 60);

/// What one pass of the loop did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub phantoms: Option<usize>,
    pub synced: Option<usize>,
    /// Rows that reached a final status since the previous pass.
    pub finished: Vec<i64>,
    pub batch: Option<BatchSummary>,
    pub reaped: Vec<i64>,
    pub orphans_killed: Option<usize>,
    pub launched: Vec<i64>,
    pub launch_failures: Vec<i64>,
}

#[derive(Debug, Default)]
struct Timers {
    phantom: Option<Instant>,
    state_sync: Option<Instant>,
    housekeeping: Option<Instant>,
}

/// True (and restarts the timer) when `every` has passed since the last run.
fn due(last: &mut Option<Instant>, every: Duration) -> bool {
    match last {
        Some(at) if at.elapsed() < every => false,
        _ => {
            *last = Some(Instant::now());
            true
        }
    }
}

pub struct CoreScheduler {
    config: Config,
    store: Arc<Store>,
    queue: Arc<QueueManager>,
    locks: Arc<ProjectLocks>,
    events: Arc<EventDispatcher>,
    inspector: Arc<dyn ProcessInspector>,
    processes: Arc<ProcessManager>,
    launcher: WorkerLauncher,
    sessions: SessionMonitor,
    recovery: RecoveryManager,
    batches: BatchProcessor,
    orphans: OrphanReaper,
    timers: Mutex<Timers>,
    /// Rows this daemon launched or adopted and has not yet seen finish.
    in_flight: Mutex<HashSet<i64>>,
}

impl CoreScheduler {
    /// Wire every component to one store, session host and process table.
    pub fn new(
        config: Config,
        store: Arc<Store>,
        events: Arc<EventDispatcher>,
        host: Arc<dyn SessionHost>,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Result<Self> {
        let queue = Arc::new(QueueManager::new(store.clone()));
        let locks = Arc::new(ProjectLocks::new(&config.lock_dir()?)?);
        let processes = Arc::new(ProcessManager::new(inspector.clone(), config.max_runtime()));
        let launcher = WorkerLauncher::new(
            host.clone(),
            queue.clone(),
            processes.clone(),
            &config.worker_command,
            &config.session_prefix,
        );
        let sessions = SessionMonitor::new(
            queue.clone(),
            host.clone(),
            inspector.clone(),
            events.clone(),
            SessionMonitorConfig::from_config(&config),
        );
        let recovery = RecoveryManager::new(
            queue.clone(),
            host.clone(),
            inspector.clone(),
            events.clone(),
            locks.clone(),
            RecoveryConfig::from_config(&config),
        );
        let batches = BatchProcessor::new(
            queue.clone(),
            store.clone(),
            events.clone(),
            Duration::from_secs(config.long_running_secs),
        );
        let orphans = OrphanReaper::new(
            queue.clone(),
            host,
            events.clone(),
            &config.session_prefix,
            Duration::from_secs(config.orphan_min_age_secs),
        )?;

        Ok(Self {
            config,
            store,
            queue,
            locks,
            events,
            inspector,
            processes,
            launcher,
            sessions,
            recovery,
            batches,
            orphans,
            timers: Mutex::new(Timers::default()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Production wiring: store and audit log under the configured home,
    /// real tmux and the OS process table.
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;
        let store = Arc::new(Store::open(&config.db_path()?)?);
        let events = Arc::new(EventDispatcher::with_audit_log(config.event_log_path()?));
        Self::new(
            config,
            store,
            events,
            Arc::new(Tmux),
            Arc::new(SystemInspector),
        )
    }

    /// Override the batch monitor's rate limit.
    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batches = self.batches.with_min_interval(interval);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run once before the loop: reboot recovery, then adopt workers a
    /// previous daemon left running.
    pub fn startup(&self) -> Result<RebootRecovery> {
        let recovered = self.recovery.recover_from_reboot()?;
        if recovered.reboot_detected {
            slog!(
                "Reboot recovery reset {} project(s)",
                recovered.reset_projects.len()
            );
        }

        let mut adopted = 0;
        for project in self.queue.get_active_projects()? {
            self.in_flight().insert(project.id);
            let Some(pid) = project.process_pid else {
                continue;
            };
            if !self.inspector.is_alive(pid) {
                continue;
            }
            let command = self
                .inspector
                .process(pid)
                .map(|p| p.command_line())
                .unwrap_or_default();
            let started_at = project.started_at.unwrap_or(project.enqueued_at);
            self.processes
                .register_started(project.id, pid, &command, started_at);
            adopted += 1;
        }
        if adopted > 0 {
            slog!("Adopted {} running worker(s)", adopted);
        }

        if !self.launcher.worker_available() {
            slog_warn!(
                "Worker command {:?} not found on PATH; launches will fail",
                self.config.worker_command
            );
        }
        self.events.dispatch(
            EventType::SchedulerStarted,
            json!({"pid": std::process::id(), "max_concurrent": self.config.max_concurrent}),
        );
        Ok(recovered)
    }

    pub fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now())
    }

    /// One pass of the coordination loop as of `now`.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        let (phantom_due, sync_due, housekeeping_due) = {
            let mut timers = self.timers();
            (
                due(
                    &mut timers.phantom,
                    Duration::from_secs(self.config.phantom_check_interval_secs),
                ),
                due(
                    &mut timers.state_sync,
                    Duration::from_secs(self.config.state_sync_interval_secs),
                ),
                due(
                    &mut timers.housekeeping,
                    Duration::from_secs(self.config.orphan_check_interval_secs),
                ),
            )
        };

        if phantom_due {
            report.phantoms = Some(self.sessions.sweep_at(now)?);
        }
        if sync_due {
            report.synced = Some(self.sessions.sync_session_state()?);
        }
        report.finished = self.reconcile_finished()?;
        report.batch = self.batches.monitor_batches_at(now)?;
        report.reaped = self.processes.reap_dead();
        if housekeeping_due {
            report.orphans_killed = Some(self.orphans.reap_at(now)?.killed_count());
            self.housekeeping();
        }
        self.fill_capacity(&mut report)?;

        if report.launched.len() + report.finished.len() + report.reaped.len() > 0 {
            slog_debug!("Tick: {:?}", report);
        }
        Ok(report)
    }

    /// Announce rows that reached a final status and stop any worker still
    /// attached to them.
    fn reconcile_finished(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> = self.in_flight().iter().copied().collect();
        let mut finished = Vec::new();
        for id in ids {
            let status = self.queue.get_project(id)?.map(|p| p.status);
            let (event, note) = match status {
                Some(ProjectStatus::Completed) => (Some(EventType::ProjectCompleted), None),
                Some(ProjectStatus::Failed) => (Some(EventType::ProjectFailed), None),
                Some(ProjectStatus::Queued) => (None, Some("reset to queued")),
                None => (None, Some("removed")),
                Some(_) => continue,
            };
            self.in_flight().remove(&id);
            if let Some(event) = event {
                self.events.dispatch(event, json!({"project_id": id}));
            }
            if self.processes.get(id).is_some() {
                let reason = note.unwrap_or("project finished");
                self.processes.kill(id, false, reason);
            }
            finished.push(id);
        }
        Ok(finished)
    }

    /// Claim and launch rows until the active count reaches the limit.
    /// A launch failure ends the fill for this pass.
    fn fill_capacity(&self, report: &mut TickReport) -> Result<()> {
        loop {
            let active = self.queue.get_queue_status()?.active() as usize;
            if active >= self.config.max_concurrent {
                return Ok(());
            }
            let Some(claimed) = self.queue.claim_next()? else {
                return Ok(());
            };
            self.events.dispatch(
                EventType::ProjectClaimed,
                json!({"project_id": claimed.id, "spec_path": claimed.spec_path}),
            );
            match self.launcher.launch(&claimed) {
                Ok(launched) => {
                    self.in_flight().insert(claimed.id);
                    self.events.dispatch(
                        EventType::ProjectLaunched,
                        json!({
                            "project_id": claimed.id,
                            "session_name": launched.session_name,
                            "pid": launched.pid,
                        }),
                    );
                    report.launched.push(claimed.id);
                }
                Err(e) => {
                    self.events.dispatch(
                        EventType::ProjectFailed,
                        json!({"project_id": claimed.id, "reason": e.to_string()}),
                    );
                    report.launch_failures.push(claimed.id);
                    return Ok(());
                }
            }
        }
    }

    fn housekeeping(&self) {
        match self.locks.cleanup_stale_locks(STALE_LOCK_AGE) {
            Ok(0) => {}
            Ok(n) => slog!("Removed {} stale project lock(s)", n),
            Err(e) => slog_warn!("Stale lock cleanup failed: {}", e),
        }
        match self.queue.cleanup_old(self.config.retention_days) {
            Ok(0) => {}
            Ok(n) => slog!("Pruned {} finished project(s)", n),
            Err(e) => slog_warn!("Queue retention cleanup failed: {}", e),
        }
    }

    /// Stop every tracked worker and announce the shutdown.
    pub fn shutdown(&self) {
        self.processes.shutdown();
        self.events
            .dispatch(EventType::SchedulerStopped, json!({"pid": std::process::id()}));
        slog!("Scheduler stopped");
    }

    /// Drive the loop until `cancel` fires.
    ///
    /// A failed tick is logged and followed by a short pause; it never ends
    /// the loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let this = self.clone();
        blocking(move || this.startup()).await?;

        let monitor = ProcessMonitorActor::new(
            self.processes.clone(),
            self.queue.clone(),
            self.events.clone(),
        )
        .with_interval(self.config.process_monitor_interval())
        .spawn();

        let mut interval = tokio::time::interval(self.config.poll_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    slog_debug!("Scheduler loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let this = self.clone();
                    if let Err(e) = blocking(move || this.tick()).await {
                        slog_error!("Scheduler tick failed: {}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(ERROR_PAUSE) => {}
                        }
                    }
                }
            }
        }

        monitor.shutdown();
        let this = self.clone();
        blocking(move || {
            this.shutdown();
            Ok(())
        })
        .await
    }
}

/// Run the daemon in the foreground until SIGINT or SIGTERM.
///
/// Refuses to start while another scheduler holds the singleton lock.
pub async fn run_daemon(config: Config) -> Result<()> {
    if !Tmux::is_available() {
        return Err(Error::Tmux("tmux not found on PATH".to_string()));
    }
    config.ensure_dirs()?;
    let lock_dir = config.lock_dir()?;
    let scheduler = Arc::new(CoreScheduler::open(config)?);

    let singleton = Arc::new(
        SchedulerLockManager::new(
            &lock_dir,
            scheduler.inspector.clone(),
            SchedulerLockConfig::default(),
        )?
        .with_store(scheduler.store.clone()),
    );
    let lock = singleton.clone();
    if !blocking(move || lock.acquire_lock()).await? {
        let holder = singleton
            .read_holder()
            .map(|info| format!("pid {} on {}", info.pid, info.hostname))
            .unwrap_or_else(|| "another scheduler".to_string());
        return Err(Error::SchedulerRunning(holder));
    }
    slog!("Scheduler started (pid {})", std::process::id());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        slog!("Shutdown signal received");
        signal_cancel.cancel();
    });

    let result = scheduler.run(cancel).await;
    singleton.release_lock();
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                slog_warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
