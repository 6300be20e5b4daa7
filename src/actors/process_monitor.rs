//! Process monitor actor: enforces the runtime limit on tracked workers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::events::{EventDispatcher, EventType};
use crate::process::{MonitorReport, ProcessManager};
use crate::queue::{ProjectStatus, QueueManager, StatusUpdate};
use crate::util::blocking;
use crate::{slog, slog_debug, slog_warn, Result};

use super::ActorHandle;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically runs [`ProcessManager::check_processes`] and writes the
/// outcome back to the queue.
pub struct ProcessMonitorActor {
    processes: Arc<ProcessManager>,
    queue: Arc<QueueManager>,
    events: Arc<EventDispatcher>,
    interval: Duration,
}

impl ProcessMonitorActor {
    pub fn new(
        processes: Arc<ProcessManager>,
        queue: Arc<QueueManager>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            processes,
            queue,
            events,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> ActorHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        slog_debug!("ProcessMonitorActor::spawn interval={:?}", self.interval);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // The first tick fires immediately; workers were just adopted.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        slog_debug!("ProcessMonitorActor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let processes = self.processes.clone();
                        let queue = self.queue.clone();
                        let events = self.events.clone();
                        let result = blocking(move || {
                            let report = processes.check_processes();
                            apply_report(&queue, &events, &report)?;
                            Ok(report)
                        })
                        .await;
                        match result {
                            Ok(report) if !report.is_empty() => {
                                slog_debug!("ProcessMonitorActor: {:?}", report);
                            }
                            Ok(_) => {}
                            Err(e) => slog_warn!("Process monitor pass failed: {}", e),
                        }
                    }
                }
            }
        });

        ActorHandle::new(cancel)
    }
}

/// Record a monitor pass in the queue.
///
/// Rows that moved on since the pass (a worker reporting completion at the
/// last moment, say) fail the transition check and are left alone.
pub fn apply_report(
    queue: &QueueManager,
    events: &EventDispatcher,
    report: &MonitorReport,
) -> Result<()> {
    for &id in &report.timing_out {
        match queue.update_status(
            id,
            ProjectStatus::TimingOut,
            StatusUpdate::default().notes("approaching max runtime"),
        ) {
            Ok(_) => {
                events.dispatch(EventType::ProjectTimingOut, json!({"project_id": id}));
            }
            Err(e) => slog_debug!("Project {} not marked timing_out: {}", id, e),
        }
    }

    for &id in &report.killed {
        match queue.update_status(
            id,
            ProjectStatus::Failed,
            StatusUpdate::default().notes("timeout: exceeded max runtime"),
        ) {
            Ok(_) => {
                slog!("Project {} failed: exceeded max runtime", id);
                events.dispatch(EventType::ProjectTimeout, json!({"project_id": id}));
            }
            Err(e) => slog_debug!("Project {} not marked failed: {}", id, e),
        }
    }

    for &id in &report.dead {
        slog_debug!("Worker for project {} exited", id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn setup() -> (Arc<QueueManager>, Arc<EventDispatcher>) {
        (
            Arc::new(QueueManager::new(Arc::new(Store::open_in_memory().unwrap()))),
            Arc::new(EventDispatcher::new()),
        )
    }

    fn claimed(queue: &QueueManager, spec: &str) -> i64 {
        let id = queue.enqueue(spec, None, 5).unwrap().unwrap();
        assert_eq!(queue.claim_next().unwrap().unwrap().id, id);
        id
    }

    #[test]
    fn test_apply_report_timing_out_then_killed() {
        let (queue, events) = setup();
        let id = claimed(&queue, "a.md");

        let warn = MonitorReport {
            timing_out: vec![id],
            ..Default::default()
        };
        apply_report(&queue, &events, &warn).unwrap();
        assert_eq!(
            queue.get_project(id).unwrap().unwrap().status,
            ProjectStatus::TimingOut
        );

        let kill = MonitorReport {
            killed: vec![id],
            ..Default::default()
        };
        apply_report(&queue, &events, &kill).unwrap();
        let project = queue.get_project(id).unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert_eq!(
            project.error_message.as_deref(),
            Some("timeout: exceeded max runtime")
        );

        let kinds: Vec<EventType> = events.history(10).iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&EventType::ProjectTimingOut));
        assert!(kinds.contains(&EventType::ProjectTimeout));
    }

    #[test]
    fn test_apply_report_skips_completed_rows() {
        let (queue, events) = setup();
        let id = claimed(&queue, "a.md");
        queue
            .update_status(id, ProjectStatus::Completed, StatusUpdate::default())
            .unwrap();

        let report = MonitorReport {
            killed: vec![id],
            ..Default::default()
        };
        apply_report(&queue, &events, &report).unwrap();
        assert_eq!(
            queue.get_project(id).unwrap().unwrap().status,
            ProjectStatus::Completed
        );
        assert_eq!(events.history_len(), 0);
    }

    #[tokio::test]
    async fn test_actor_stops_on_shutdown() {
        let (queue, events) = setup();
        let inspector = Arc::new(crate::testing::FakeProcessInspector::new());
        let processes = Arc::new(ProcessManager::new(inspector, Duration::from_secs(60)));
        let handle = ProcessMonitorActor::new(processes, queue, events)
            .with_interval(Duration::from_millis(10))
            .spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown();
        assert!(handle.is_cancelled());
    }
}
