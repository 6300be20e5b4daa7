//! Batch progress tracking.
//!
//! A batch is the stretch between the queue first having work and the queue
//! going fully idle again. When that happens, one `batch_complete` event
//! summarises what finished.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;

use crate::events::{EventDispatcher, EventType};
use crate::queue::{ProjectStatus, QueueManager};
use crate::store::Store;
use crate::{slog, slog_debug, slog_warn, Result};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60);
const WINDOW_HOURS: i64 = 24;
const BATCH_SEQUENCE: &str = "batch";

/// Snapshot produced by one monitoring pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub queued: u64,
    /// Rows owning a worker: `processing` plus `timing_out`.
    pub active: u64,
    /// Completed rows within the rolling 24h window.
    pub completed_24h: u64,
    /// Failed rows within the rolling 24h window.
    pub failed_24h: u64,
    /// Oldest claimed row past the long-running threshold, with its runtime.
    pub long_running: Option<(i64, u64)>,
    /// Set when this pass closed a batch.
    pub completed_batch: Option<i64>,
}

#[derive(Debug, Default)]
struct BatchState {
    last_run: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    flagged: Option<i64>,
}

pub struct BatchProcessor {
    queue: Arc<QueueManager>,
    store: Arc<Store>,
    events: Arc<EventDispatcher>,
    min_interval: Duration,
    long_running: Duration,
    state: Mutex<BatchState>,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<QueueManager>,
        store: Arc<Store>,
        events: Arc<EventDispatcher>,
        long_running: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            events,
            min_interval: DEFAULT_MIN_INTERVAL,
            long_running,
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn monitor_batches(&self) -> Result<Option<BatchSummary>> {
        self.monitor_batches_at(Utc::now())
    }

    /// One pass as of `now`. Returns `None` when rate-limited.
    pub fn monitor_batches_at(&self, now: DateTime<Utc>) -> Result<Option<BatchSummary>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = state.last_run {
            if last.elapsed() < self.min_interval {
                return Ok(None);
            }
        }
        state.last_run = Some(Instant::now());

        let live = self.queue.get_queue_status()?;
        let window = self
            .queue
            .counts_since(now - ChronoDuration::hours(WINDOW_HOURS))?;
        let mut summary = BatchSummary {
            queued: live.get(ProjectStatus::Queued),
            active: live.active(),
            completed_24h: window.get(ProjectStatus::Completed),
            failed_24h: window.get(ProjectStatus::Failed),
            ..Default::default()
        };

        let oldest = self
            .queue
            .get_active_projects()?
            .into_iter()
            .filter_map(|p| p.runtime_at(now).map(|runtime| (p.id, runtime)))
            .filter(|(_, runtime)| *runtime > self.long_running)
            .max_by_key(|(_, runtime)| *runtime);
        if let Some((id, runtime)) = oldest {
            summary.long_running = Some((id, runtime.as_secs()));
            if state.flagged != Some(id) {
                state.flagged = Some(id);
                slog_warn!(
                    "Project {} has been running for {}m",
                    id,
                    runtime.as_secs() / 60
                );
                self.events.dispatch(
                    EventType::LongRunningProject,
                    json!({"project_id": id, "runtime_secs": runtime.as_secs()}),
                );
            }
        }

        let busy = summary.queued > 0 || summary.active > 0;
        match (busy, state.started_at) {
            (true, None) => {
                slog_debug!("Batch started");
                state.started_at = Some(now);
            }
            (false, Some(started_at)) => {
                state.started_at = None;
                state.flagged = None;
                let batch_id = self.store.next_sequence(BATCH_SEQUENCE)?;
                let finished = self.queue.counts_since(started_at)?;
                let completed = finished.get(ProjectStatus::Completed);
                let failed = finished.get(ProjectStatus::Failed);
                slog!(
                    "Batch {} complete: {} completed, {} failed",
                    batch_id,
                    completed,
                    failed
                );
                self.events.dispatch(
                    EventType::BatchComplete,
                    json!({
                        "batch_id": batch_id,
                        "started_at": started_at,
                        "completed": completed,
                        "failed": failed,
                        "duration_secs": crate::util::elapsed_between(&started_at, &now).as_secs(),
                    }),
                );
                summary.completed_batch = Some(batch_id);
            }
            _ => {}
        }

        slog_debug!(
            "Batch pass: queued={} active={} completed_24h={} failed_24h={}",
            summary.queued,
            summary.active,
            summary.completed_24h,
            summary.failed_24h
        );
        Ok(Some(summary))
    }
}
