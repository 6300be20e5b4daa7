//! In-memory stand-ins for the session host and the OS process table.
//!
//! Used by unit and integration tests to drive the monitors and the daemon
//! without tmux or real worker processes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::process::{ProcessInfo, ProcessInspector};
use crate::tmux::{HostSession, HostWindow, SessionHost};
use crate::{Error, Result};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fake process table.
#[derive(Debug)]
pub struct FakeProcessInspector {
    processes: Mutex<HashMap<u32, ProcessInfo>>,
    ignores_term: Mutex<HashSet<u32>>,
    terminated: Mutex<Vec<u32>>,
    killed: Mutex<Vec<u32>>,
    uptime: Mutex<Duration>,
}

impl Default for FakeProcessInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcessInspector {
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            ignores_term: Mutex::new(HashSet::new()),
            terminated: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            uptime: Mutex::new(Duration::from_secs(24 * 60 * 60)),
        }
    }

    pub fn add(&self, info: ProcessInfo) {
        lock(&self.processes).insert(info.pid, info);
    }

    pub fn remove(&self, pid: u32) {
        lock(&self.processes).remove(&pid);
    }

    /// Make `pid` survive SIGTERM (only SIGKILL removes it).
    pub fn ignore_term(&self, pid: u32) {
        lock(&self.ignores_term).insert(pid);
    }

    pub fn set_uptime(&self, uptime: Duration) {
        *lock(&self.uptime) = uptime;
    }

    pub fn terminated(&self) -> Vec<u32> {
        lock(&self.terminated).clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        lock(&self.killed).clone()
    }
}

impl ProcessInspector for FakeProcessInspector {
    fn process(&self, pid: u32) -> Option<ProcessInfo> {
        lock(&self.processes).get(&pid).cloned()
    }

    fn list(&self) -> Vec<ProcessInfo> {
        let mut all: Vec<ProcessInfo> = lock(&self.processes).values().cloned().collect();
        all.sort_by_key(|p| p.pid);
        all
    }

    fn terminate(&self, pid: u32) -> bool {
        lock(&self.terminated).push(pid);
        if lock(&self.ignores_term).contains(&pid) {
            return lock(&self.processes).contains_key(&pid);
        }
        lock(&self.processes).remove(&pid).is_some()
    }

    fn kill(&self, pid: u32) -> bool {
        lock(&self.killed).push(pid);
        lock(&self.processes).remove(&pid).is_some()
    }

    fn uptime(&self) -> Duration {
        *lock(&self.uptime)
    }
}

/// A session held by [`FakeSessionHost`].
#[derive(Debug, Clone)]
pub struct FakeSession {
    pub created: Option<DateTime<Utc>>,
    pub cwd: PathBuf,
    pub command: Vec<String>,
    pub windows: Vec<HostWindow>,
    pub pane_pid: Option<u32>,
    /// Text returned by `capture_pane`.
    pub output: String,
}

/// Fake terminal multiplexer.
///
/// When built with [`FakeSessionHost::with_processes`], every created session
/// also spawns a fake process running its command, and killing the session
/// removes it.
#[derive(Debug, Default)]
pub struct FakeSessionHost {
    sessions: Mutex<BTreeMap<String, FakeSession>>,
    killed: Mutex<Vec<String>>,
    sent_keys: Mutex<Vec<(String, String)>>,
    fail_create: AtomicBool,
    next_pid: AtomicU32,
    processes: Option<Arc<FakeProcessInspector>>,
}

impl FakeSessionHost {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(10_000),
            ..Default::default()
        }
    }

    pub fn with_processes(processes: Arc<FakeProcessInspector>) -> Self {
        Self {
            processes: Some(processes),
            ..Self::new()
        }
    }

    /// Insert a session directly, with one window running `command`.
    pub fn add_session(&self, name: &str, created: Option<DateTime<Utc>>, command: &str) {
        lock(&self.sessions).insert(
            name.to_string(),
            FakeSession {
                created,
                cwd: PathBuf::from("/"),
                command: vec![command.to_string()],
                windows: vec![HostWindow {
                    index: 0,
                    name: "main".to_string(),
                    current_command: command.to_string(),
                }],
                pane_pid: None,
                output: String::new(),
            },
        );
    }

    pub fn set_windows(&self, name: &str, windows: Vec<HostWindow>) {
        if let Some(session) = lock(&self.sessions).get_mut(name) {
            session.windows = windows;
        }
    }

    pub fn set_output(&self, name: &str, output: &str) {
        if let Some(session) = lock(&self.sessions).get_mut(name) {
            session.output = output.to_string();
        }
    }

    pub fn session(&self, name: &str) -> Option<FakeSession> {
        lock(&self.sessions).get(name).cloned()
    }

    pub fn session_names(&self) -> Vec<String> {
        lock(&self.sessions).keys().cloned().collect()
    }

    pub fn killed(&self) -> Vec<String> {
        lock(&self.killed).clone()
    }

    pub fn sent_keys(&self) -> Vec<(String, String)> {
        lock(&self.sent_keys).clone()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

impl SessionHost for FakeSessionHost {
    fn create_session(&self, name: &str, cwd: &Path, cmd: &[String]) -> Result<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Tmux(format!("create session '{}' failed", name)));
        }
        if cmd.is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(name) {
            return Err(Error::Tmux(format!("duplicate session: {}", name)));
        }
        let pane_pid = self.processes.as_ref().map(|processes| {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            let argv: Vec<&str> = cmd.iter().map(String::as_str).collect();
            processes.add(ProcessInfo::new(pid, &argv).started_at(Utc::now()));
            pid
        });
        let program = Path::new(&cmd[0])
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| cmd[0].clone());
        sessions.insert(
            name.to_string(),
            FakeSession {
                created: Some(Utc::now()),
                cwd: cwd.to_path_buf(),
                command: cmd.to_vec(),
                windows: vec![HostWindow {
                    index: 0,
                    name: "main".to_string(),
                    current_command: program,
                }],
                pane_pid,
                output: String::new(),
            },
        );
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<HostSession>> {
        Ok(lock(&self.sessions)
            .iter()
            .map(|(name, s)| HostSession {
                name: name.clone(),
                created: s.created,
            })
            .collect())
    }

    fn list_windows(&self, session: &str) -> Result<Vec<HostWindow>> {
        lock(&self.sessions)
            .get(session)
            .map(|s| s.windows.clone())
            .ok_or_else(|| Error::Tmux(format!("can't find session: {}", session)))
    }

    fn send_keys(&self, target: &str, keys: &str) -> Result<()> {
        if !lock(&self.sessions).contains_key(target) {
            return Err(Error::Tmux(format!("can't find session: {}", target)));
        }
        lock(&self.sent_keys).push((target.to_string(), keys.to_string()));
        Ok(())
    }

    fn capture_pane(&self, target: &str, lines: u16) -> Result<String> {
        let sessions = lock(&self.sessions);
        let session = sessions
            .get(target)
            .ok_or_else(|| Error::Tmux(format!("can't find session: {}", target)))?;
        let all: Vec<&str> = session.output.lines().collect();
        let skip = all.len().saturating_sub(usize::from(lines));
        Ok(all[skip..].join("\n"))
    }

    fn session_exists(&self, name: &str) -> bool {
        lock(&self.sessions).contains_key(name)
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        let removed = lock(&self.sessions).remove(name);
        if let Some(session) = removed {
            lock(&self.killed).push(name.to_string());
            if let (Some(processes), Some(pid)) = (&self.processes, session.pane_pid) {
                processes.remove(pid);
            }
        }
        Ok(())
    }

    fn pane_pid(&self, session: &str) -> Result<Option<u32>> {
        lock(&self.sessions)
            .get(session)
            .map(|s| s.pane_pid)
            .ok_or_else(|| Error::Tmux(format!("can't find session: {}", session)))
    }
}
