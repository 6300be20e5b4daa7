//! In-process event bus for lifecycle notifications.
//!
//! Handlers run synchronously on the dispatching thread, each isolated so a
//! failing or panicking handler cannot stop the others. An event that would
//! re-enter itself on the same thread (a handler dispatching the same type
//! with the same payload) is dropped. `dispatch_async` hands events to a
//! single background worker thread fed by a crossbeam channel.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::OpenOptions;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{slog_debug, slog_error, slog_trace, slog_warn, Result};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProjectEnqueued,
    ProjectClaimed,
    ProjectLaunched,
    ProjectCompleted,
    ProjectFailed,
    ProjectTimingOut,
    ProjectTimeout,
    PhantomDetected,
    ZombieDetected,
    ProjectRecovered,
    RebootRecovered,
    OrphanSessionKilled,
    LongRunningProject,
    BatchComplete,
    SchedulerStarted,
    SchedulerStopped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProjectEnqueued => "project_enqueued",
            EventType::ProjectClaimed => "project_claimed",
            EventType::ProjectLaunched => "project_launched",
            EventType::ProjectCompleted => "project_completed",
            EventType::ProjectFailed => "project_failed",
            EventType::ProjectTimingOut => "project_timing_out",
            EventType::ProjectTimeout => "project_timeout",
            EventType::PhantomDetected => "phantom_detected",
            EventType::ZombieDetected => "zombie_detected",
            EventType::ProjectRecovered => "project_recovered",
            EventType::RebootRecovered => "reboot_recovered",
            EventType::OrphanSessionKilled => "orphan_session_killed",
            EventType::LongRunningProject => "long_running_project",
            EventType::BatchComplete => "batch_complete",
            EventType::SchedulerStarted => "scheduler_started",
            EventType::SchedulerStopped => "scheduler_stopped",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// Identity of an in-flight dispatch, for re-entrance detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DispatchKey {
    event_type: EventType,
    payload_hash: u64,
    thread: ThreadId,
}

impl DispatchKey {
    fn new(event_type: EventType, data: &Value) -> Self {
        let mut hasher = DefaultHasher::new();
        data.to_string().hash(&mut hasher);
        Self {
            event_type,
            payload_hash: hasher.finish(),
            thread: thread::current().id(),
        }
    }
}

struct Inner {
    subscribers: RwLock<HashMap<EventType, Vec<EventHandler>>>,
    in_flight: Mutex<HashSet<DispatchKey>>,
    history: Mutex<VecDeque<Event>>,
    history_capacity: usize,
    audit_log: Option<PathBuf>,
}

/// Removes the dispatch key when the dispatch finishes, even on unwind.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<DispatchKey>>,
    key: Option<DispatchKey>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(self.set).remove(&key);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn dispatch(&self, event_type: EventType, data: Value) -> usize {
        let key = DispatchKey::new(event_type, &data);
        if !lock(&self.in_flight).insert(key.clone()) {
            slog_debug!("Dropping re-entrant {} event", event_type);
            return 0;
        }
        let _guard = InFlight {
            set: &self.in_flight,
            key: Some(key),
        };

        let event = Event::new(event_type, data);
        self.record(&event);

        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_type)
            .cloned()
            .unwrap_or_default();
        slog_trace!("Dispatching {} to {} handlers", event_type, handlers.len());

        let mut succeeded = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => slog_warn!("{} handler failed: {}", event_type, e),
                Err(_) => slog_error!("{} handler panicked", event_type),
            }
        }
        succeeded
    }

    fn record(&self, event: &Event) {
        {
            let mut history = lock(&self.history);
            if history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        if let Some(path) = &self.audit_log {
            if let Err(e) = append_json_line(path, event) {
                slog_warn!("Failed to append event to {}: {}", path.display(), e);
            }
        }
    }
}

fn append_json_line(path: &Path, event: &Event) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(event)?)?;
    Ok(())
}

pub struct EventDispatcher {
    inner: Arc<Inner>,
    async_tx: Mutex<Option<Sender<(EventType, Value)>>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::build(DEFAULT_HISTORY_CAPACITY, None)
    }

    /// Also append every dispatched event to `path` as one JSON line.
    pub fn with_audit_log(path: PathBuf) -> Self {
        Self::build(DEFAULT_HISTORY_CAPACITY, Some(path))
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        Self::build(capacity.max(1), None)
    }

    fn build(history_capacity: usize, audit_log: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                history: Mutex::new(VecDeque::new()),
                history_capacity,
                audit_log,
            }),
            async_tx: Mutex::new(None),
        }
    }

    /// Register `handler` for `event_type`. Registering the same handler
    /// (same `Arc`) twice is a no-op.
    pub fn subscribe(&self, event_type: EventType, handler: EventHandler) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let handlers = subscribers.entry(event_type).or_default();
        if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return;
        }
        handlers.push(handler);
    }

    /// Remove `handler`. Returns whether it was registered.
    pub fn unsubscribe(&self, event_type: EventType, handler: &EventHandler) -> bool {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let Some(handlers) = subscribers.get_mut(&event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        before != handlers.len()
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Deliver synchronously. Returns how many handlers succeeded.
    pub fn dispatch(&self, event_type: EventType, data: Value) -> usize {
        self.inner.dispatch(event_type, data)
    }

    /// Queue the event for the background worker thread.
    pub fn dispatch_async(&self, event_type: EventType, data: Value) {
        let mut tx = lock(&self.async_tx);
        if tx.is_none() {
            let (sender, receiver) = crossbeam_channel::unbounded::<(EventType, Value)>();
            let inner = self.inner.clone();
            let spawned = thread::Builder::new()
                .name("spool-events".to_string())
                .spawn(move || {
                    for (event_type, data) in receiver {
                        inner.dispatch(event_type, data);
                    }
                    slog_debug!("Event worker exiting");
                });
            match spawned {
                Ok(_) => *tx = Some(sender),
                Err(e) => {
                    slog_warn!("Failed to start event worker, dispatching inline: {}", e);
                    drop(tx);
                    self.inner.dispatch(event_type, data);
                    return;
                }
            }
        }
        if let Some(sender) = tx.as_ref() {
            if let Err(crossbeam_channel::SendError((event_type, _))) =
                sender.send((event_type, data))
            {
                slog_warn!("Event worker gone, dropping {} event", event_type);
            }
        }
    }

    /// Most recent events, oldest first, at most `limit`.
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let history = lock(&self.inner.history);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.inner.history).len()
    }
}

/// Read the newest `limit` events from a JSON-lines audit log.
pub fn read_audit_log(path: &Path, limit: usize) -> Result<Vec<Event>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let events: Vec<Event> = contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    let skip = events.len().saturating_sub(limit);
    Ok(events.into_iter().skip(skip).collect())
}
