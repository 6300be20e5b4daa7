//! Singleton lock for the scheduler daemon.
//!
//! Acquisition is multi-phase: scan the process table for a live scheduler,
//! clear artifacts left by dead ones, take the OS file lock, wait a moment and
//! scan again for a racer, then publish our identity. The OS lock alone is
//! what guarantees exclusion; the scans and metadata exist to give a clear
//! answer about who holds it and to clean up after crashes.
//!
//! Lock files are only ever unlinked by a process holding their lock, and a
//! lock only counts once the locked inode is verified to still be the one at
//! the lock path. Together these keep a holder from being made invisible by
//! someone deleting its file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::process::{ProcessInfo, ProcessInspector};
use crate::store::{LockHolderRecord, Store};
use crate::util::format_ts;
use crate::{slog, slog_debug, slog_warn, Result};

use super::project::{is_contended, try_lock_file, LockAttempt};

pub const SCHEDULER_LOCK_FILE: &str = "scheduler.lock";
pub const SCHEDULER_INFO_FILE: &str = "scheduler_process.info";
const LOCK_NAME: &str = "scheduler";
/// Attempts at locking the lock path when it keeps being replaced under us.
const LINK_ATTEMPTS: usize = 3;

/// Identity written into the lock and info files by the holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerLockInfo {
    pub pid: u32,
    pub signature: String,
    pub acquired_at: String,
    pub hostname: String,
    #[serde(default)]
    pub exe: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// A process that looks like a running scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerProcess {
    pub pid: u32,
    pub command_line: String,
}

#[derive(Debug, Clone)]
pub struct SchedulerLockConfig {
    /// Every marker must appear in a process's command line for it to count
    /// as a scheduler.
    pub markers: Vec<String>,
    /// Pause between taking the OS lock and the confirming re-scan.
    pub settle_delay: Duration,
    /// Processes younger than this are ignored by the initial scan; they are
    /// most likely a sibling racing us and the OS lock settles that race. The
    /// confirming re-scan does not apply it.
    pub startup_window: Duration,
}

impl Default for SchedulerLockConfig {
    fn default() -> Self {
        Self {
            markers: vec!["spool".to_string(), "daemon".to_string()],
            settle_delay: Duration::from_millis(500),
            startup_window: Duration::from_secs(2),
        }
    }
}

pub struct SchedulerLockManager {
    lock_path: PathBuf,
    info_path: PathBuf,
    inspector: Arc<dyn ProcessInspector>,
    store: Option<Arc<Store>>,
    config: SchedulerLockConfig,
    own_pid: u32,
    held: Mutex<Option<File>>,
}

impl SchedulerLockManager {
    pub fn new(
        dir: &Path,
        inspector: Arc<dyn ProcessInspector>,
        config: SchedulerLockConfig,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            lock_path: dir.join(SCHEDULER_LOCK_FILE),
            info_path: dir.join(SCHEDULER_INFO_FILE),
            inspector,
            store: None,
            config,
            own_pid: std::process::id(),
            held: Mutex::new(None),
        })
    }

    /// Mirror the holder into the store's `lock_metadata` table.
    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Act as a different pid (tests simulate several schedulers in one process).
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn info_path(&self) -> &Path {
        &self.info_path
    }

    pub fn is_held(&self) -> bool {
        self.held_file().is_some()
    }

    fn held_file(&self) -> std::sync::MutexGuard<'_, Option<File>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hex SHA-256 over executable, arguments, working directory and pid.
    pub fn generate_signature(&self) -> String {
        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let args: Vec<String> = std::env::args().collect();
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        signature_of(&exe, &args, &cwd, self.own_pid)
    }

    /// Decide whether `pid` is a live scheduler, with the reason.
    pub fn is_scheduler_process(&self, pid: u32) -> (bool, String) {
        match self.inspector.process(pid) {
            None => (false, "process not running".to_string()),
            Some(info) => self.classify(&info, true),
        }
    }

    /// Like [`is_scheduler_process`](Self::is_scheduler_process) without the
    /// startup window: a recorded holder is never a newcomer.
    fn holder_is_live(&self, pid: u32) -> (bool, String) {
        match self.inspector.process(pid) {
            None => (false, "process not running".to_string()),
            Some(info) => self.classify(&info, false),
        }
    }

    fn classify(&self, info: &ProcessInfo, startup_window: bool) -> (bool, String) {
        if info.zombie {
            return (false, "process is a zombie".to_string());
        }
        let cmdline = info.command_line();
        if let Some(missing) = self
            .config
            .markers
            .iter()
            .find(|marker| !cmdline.contains(marker.as_str()))
        {
            return (false, format!("command line lacks '{}'", missing));
        }
        if let Some(age) = info.age_at(Utc::now()).filter(|_| startup_window) {
            if age < self.config.startup_window {
                return (false, format!("started {:?} ago, inside startup window", age));
            }
        }
        (true, "running scheduler".to_string())
    }

    /// Other live scheduler processes, excluding ourselves.
    pub fn find_existing_schedulers(&self) -> Vec<SchedulerProcess> {
        self.scan(true)
    }

    fn scan(&self, startup_window: bool) -> Vec<SchedulerProcess> {
        self.inspector
            .list()
            .into_iter()
            .filter(|info| info.pid != self.own_pid && info.pid != std::process::id())
            .filter(|info| self.classify(info, startup_window).0)
            .map(|info| SchedulerProcess {
                pid: info.pid,
                command_line: info.command_line(),
            })
            .collect()
    }

    /// Read the published holder, if any.
    pub fn read_holder(&self) -> Option<SchedulerLockInfo> {
        read_info(&self.info_path).or_else(|| read_info(&self.lock_path))
    }

    /// Whether any process (including this one) holds the OS lock.
    pub fn is_locked(&self) -> bool {
        if self.is_held() {
            return true;
        }
        let Ok(file) = OpenOptions::new().read(true).write(true).open(&self.lock_path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(e) => is_contended(&e),
        }
    }

    /// Try to become the single scheduler. `Ok(false)` means another one runs.
    pub fn acquire_lock(&self) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }

        let existing = self.find_existing_schedulers();
        if let Some(other) = existing.first() {
            slog_warn!(
                "Scheduler already running as pid {} ({})",
                other.pid,
                other.command_line
            );
            return Ok(false);
        }

        self.cleanup_stale_artifacts()?;

        let Some(file) = self.lock_linked()? else {
            slog_warn!(
                "Scheduler lock {} is held by another process",
                self.lock_path.display()
            );
            return Ok(false);
        };

        if !self.config.settle_delay.is_zero() {
            std::thread::sleep(self.config.settle_delay);
        }
        if let Some(racer) = self.scan(false).first() {
            slog_warn!(
                "Scheduler pid {} appeared while acquiring; backing off",
                racer.pid
            );
            // Still holding the lock, so the file is ours to remove.
            if let Err(e) = fs::remove_file(&self.lock_path) {
                slog_debug!("Failed to remove {}: {}", self.lock_path.display(), e);
            }
            let _ = FileExt::unlock(&file);
            return Ok(false);
        }

        let info = self.identity();
        let mut file = file;
        write_info(&mut file, &info)?;
        let mut info_file = File::create(&self.info_path)?;
        write_info(&mut info_file, &info)?;

        if let Some(store) = &self.store {
            if let Err(e) = store.record_lock_holder(&LockHolderRecord {
                name: LOCK_NAME.to_string(),
                holder_pid: info.pid,
                hostname: info.hostname.clone(),
                signature: info.signature.clone(),
                acquired_at: info.acquired_at.clone(),
            }) {
                slog_warn!("Failed to record scheduler lock holder: {}", e);
            }
        }

        *self.held_file() = Some(file);
        slog!(
            "Acquired scheduler lock (pid {}, signature {})",
            info.pid,
            &info.signature[..12.min(info.signature.len())]
        );
        Ok(true)
    }

    /// Lock the file at the lock path, retrying when the inode we locked was
    /// unlinked or replaced first. `Ok(None)` means another process holds it.
    fn lock_linked(&self) -> Result<Option<File>> {
        for attempt in 1..=LINK_ATTEMPTS {
            match try_lock_file(&self.lock_path, true)? {
                LockAttempt::Locked(file) => return Ok(Some(file)),
                LockAttempt::Held => return Ok(None),
                LockAttempt::Unlinked | LockAttempt::Missing => slog_debug!(
                    "Scheduler lock file replaced during attempt {}, retrying",
                    attempt
                ),
            }
        }
        Ok(None)
    }

    fn clear_store_holder(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_lock_holder(LOCK_NAME) {
                slog_warn!("Failed to clear scheduler lock holder: {}", e);
            }
        }
    }

    /// Release the lock and remove both files. Safe to call when not held.
    pub fn release_lock(&self) {
        let Some(file) = self.held_file().take() else {
            return;
        };
        for path in [&self.info_path, &self.lock_path] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    slog_warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
        let _ = FileExt::unlock(&file);
        self.clear_store_holder();
        slog!("Released scheduler lock");
    }

    /// Remove lock artifacts whose recorded holder is no longer a scheduler.
    ///
    /// The lock file is removed only while we hold its OS lock, so a live
    /// holder that merely fails the heuristics keeps its files.
    pub fn cleanup_stale_artifacts(&self) -> Result<bool> {
        if self.is_held() {
            return Ok(false);
        }
        let Some(holder) = self.read_holder() else {
            return Ok(false);
        };
        let (valid, reason) = self.holder_is_live(holder.pid);
        if valid {
            return Ok(false);
        }

        let guard = match try_lock_file(&self.lock_path, false)? {
            LockAttempt::Locked(file) => Some(file),
            LockAttempt::Missing => None,
            LockAttempt::Held | LockAttempt::Unlinked => {
                slog_debug!(
                    "Recorded scheduler pid {} looks invalid ({}) but the lock is held",
                    holder.pid,
                    reason
                );
                return Ok(false);
            }
        };
        // A new holder may have published itself since we read the files.
        if self.read_holder().map(|h| h.pid) != Some(holder.pid) {
            return Ok(false);
        }

        slog!(
            "Removing stale scheduler lock from pid {}: {}",
            holder.pid,
            reason
        );
        for path in [&self.info_path, &self.lock_path] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        if let Some(file) = guard {
            let _ = FileExt::unlock(&file);
        }
        self.clear_store_holder();
        Ok(true)
    }

    fn identity(&self) -> SchedulerLockInfo {
        let exe = std::env::current_exe()
            .ok()
            .map(|p| p.display().to_string());
        let cwd = std::env::current_dir()
            .ok()
            .map(|p| p.display().to_string());
        SchedulerLockInfo {
            pid: self.own_pid,
            signature: self.generate_signature(),
            acquired_at: format_ts(&Utc::now()),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            exe,
            args: std::env::args().collect(),
            cwd,
        }
    }
}

impl Drop for SchedulerLockManager {
    fn drop(&mut self) {
        self.release_lock();
    }
}

fn signature_of(exe: &str, args: &[String], cwd: &str, pid: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(exe.as_bytes());
    hasher.update([0u8]);
    for arg in args {
        hasher.update(arg.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(cwd.as_bytes());
    hasher.update([0u8]);
    hasher.update(pid.to_le_bytes());
    hex::encode(hasher.finalize())
}

fn write_info(file: &mut File, info: &SchedulerLockInfo) -> Result<()> {
    let json = serde_json::to_string_pretty(info)?;
    file.set_len(0)?;
    // set_len leaves the cursor where it was.
    file.seek(SeekFrom::Start(0))?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_info(path: &Path) -> Option<SchedulerLockInfo> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProcessInspector;
    use tempfile::TempDir;

    fn quick() -> SchedulerLockConfig {
        SchedulerLockConfig {
            settle_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn old() -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(10)
    }

    #[test]
    fn test_signature_is_stable_and_pid_sensitive() {
        let args = vec!["spool".to_string(), "daemon".to_string()];
        let a = signature_of("/bin/spool", &args, "/home", 10);
        assert_eq!(a, signature_of("/bin/spool", &args, "/home", 10));
        assert_ne!(a, signature_of("/bin/spool", &args, "/home", 11));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_acquire_writes_metadata_and_release_removes_it() {
        let dir = TempDir::new().unwrap();
        let inspector = Arc::new(FakeProcessInspector::new());
        let manager = SchedulerLockManager::new(dir.path(), inspector, quick()).unwrap();

        assert!(manager.acquire_lock().unwrap());
        let holder = manager.read_holder().unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.signature.len(), 64);
        assert!(manager.info_path().exists());
        assert!(manager.is_locked());

        manager.release_lock();
        assert!(!manager.lock_path().exists());
        assert!(!manager.info_path().exists());
        assert!(!manager.is_locked());
    }

    #[test]
    fn test_live_scheduler_blocks_acquire() {
        let dir = TempDir::new().unwrap();
        let inspector = Arc::new(FakeProcessInspector::new());
        inspector.add(ProcessInfo::new(4242, &["/usr/bin/spool", "daemon"]).started_at(old()));
        let manager = SchedulerLockManager::new(dir.path(), inspector, quick()).unwrap();

        assert!(!manager.acquire_lock().unwrap());
        assert!(!manager.lock_path().exists());
    }

    #[test]
    fn test_classify_reasons() {
        let dir = TempDir::new().unwrap();
        let inspector = Arc::new(FakeProcessInspector::new());
        inspector.add(ProcessInfo::new(1, &["vim", "notes"]).started_at(old()));
        inspector.add(ProcessInfo::new(2, &["spool", "daemon"]).started_at(Utc::now()));
        let mut zombie = ProcessInfo::new(3, &["spool", "daemon"]).started_at(old());
        zombie.zombie = true;
        inspector.add(zombie);
        inspector.add(ProcessInfo::new(4, &["spool", "daemon"]).started_at(old()));
        let manager = SchedulerLockManager::new(dir.path(), inspector, quick()).unwrap();

        assert!(!manager.is_scheduler_process(1).0);
        let (young, reason) = manager.is_scheduler_process(2);
        assert!(!young);
        assert!(reason.contains("startup window"));
        assert!(!manager.is_scheduler_process(3).0);
        assert!(manager.is_scheduler_process(4).0);
        assert_eq!(
            manager.is_scheduler_process(5).1,
            "process not running".to_string()
        );
    }

    #[test]
    fn test_stale_artifacts_from_dead_holder_are_cleared() {
        let dir = TempDir::new().unwrap();
        let info = SchedulerLockInfo {
            pid: 777,
            signature: "dead".to_string(),
            acquired_at: format_ts(&old()),
            hostname: "h".to_string(),
            exe: None,
            args: vec![],
            cwd: None,
        };
        fs::write(dir.path().join(SCHEDULER_LOCK_FILE), serde_json::to_string(&info).unwrap())
            .unwrap();
        fs::write(dir.path().join(SCHEDULER_INFO_FILE), serde_json::to_string(&info).unwrap())
            .unwrap();

        let inspector = Arc::new(FakeProcessInspector::new());
        let manager = SchedulerLockManager::new(dir.path(), inspector, quick()).unwrap();
        assert!(manager.acquire_lock().unwrap());
        assert_eq!(manager.read_holder().unwrap().pid, std::process::id());
    }

    #[test]
    fn test_second_manager_cannot_acquire_held_lock() {
        let dir = TempDir::new().unwrap();
        let inspector = Arc::new(FakeProcessInspector::new());
        let first = SchedulerLockManager::new(dir.path(), inspector.clone(), quick())
            .unwrap()
            .with_pid(100);
        let second = SchedulerLockManager::new(dir.path(), inspector, quick())
            .unwrap()
            .with_pid(200);

        assert!(first.acquire_lock().unwrap());
        assert!(!second.acquire_lock().unwrap());
        // The loser must not have disturbed the winner's metadata.
        assert_eq!(first.read_holder().unwrap().pid, 100);

        first.release_lock();
        assert!(second.acquire_lock().unwrap());
        assert_eq!(second.read_holder().unwrap().pid, 200);
    }

    #[test]
    fn test_racer_seen_in_settle_window_backs_off() {
        let dir = TempDir::new().unwrap();
        let inspector = Arc::new(FakeProcessInspector::new());
        // Too young for the first scan, but visible to the confirming one.
        inspector.add(ProcessInfo::new(300, &["spool", "daemon"]).started_at(Utc::now()));
        let manager = SchedulerLockManager::new(dir.path(), inspector, quick())
            .unwrap()
            .with_pid(100);

        assert!(manager.find_existing_schedulers().is_empty());
        assert!(!manager.acquire_lock().unwrap());
        assert!(!manager.is_held());
        assert!(!manager.is_locked());
        assert!(!manager.lock_path().exists());
        assert!(!manager.info_path().exists());
    }

    #[test]
    fn test_unlinked_lock_file_does_not_admit_second_holder() {
        let dir = TempDir::new().unwrap();
        let inspector = Arc::new(FakeProcessInspector::new());
        inspector.add(ProcessInfo::new(100, &["spool", "daemon"]).started_at(Utc::now()));
        let first = SchedulerLockManager::new(dir.path(), inspector.clone(), quick())
            .unwrap()
            .with_pid(100);
        let second = SchedulerLockManager::new(dir.path(), inspector, quick())
            .unwrap()
            .with_pid(200);

        assert!(first.acquire_lock().unwrap());
        fs::remove_file(first.lock_path()).unwrap();

        assert!(!second.acquire_lock().unwrap());
        assert!(first.is_held());
        assert!(!second.is_held());
        // The live holder's record survives the failed attempt.
        assert_eq!(second.read_holder().unwrap().pid, 100);
    }

    #[test]
    fn test_replaced_lock_file_does_not_admit_second_holder() {
        let dir = TempDir::new().unwrap();
        let inspector = Arc::new(FakeProcessInspector::new());
        inspector.add(ProcessInfo::new(100, &["spool", "daemon"]).started_at(old()));
        let first = SchedulerLockManager::new(dir.path(), inspector.clone(), quick())
            .unwrap()
            .with_pid(100);
        let second = SchedulerLockManager::new(dir.path(), inspector, quick())
            .unwrap()
            .with_pid(200);

        assert!(first.acquire_lock().unwrap());
        fs::remove_file(first.lock_path()).unwrap();
        fs::write(first.lock_path(), b"").unwrap();

        assert!(!second.acquire_lock().unwrap());
        assert!(first.is_held());
    }

    #[test]
    fn test_cleanup_leaves_held_lock_alone() {
        let dir = TempDir::new().unwrap();
        let inspector = Arc::new(FakeProcessInspector::new());
        // Pid 777 is not in the process table, so the holder looks dead.
        let holder = SchedulerLockManager::new(dir.path(), inspector.clone(), quick())
            .unwrap()
            .with_pid(777);
        let cleaner = SchedulerLockManager::new(dir.path(), inspector, quick())
            .unwrap()
            .with_pid(888);

        assert!(holder.acquire_lock().unwrap());
        assert!(!cleaner.cleanup_stale_artifacts().unwrap());
        assert!(holder.lock_path().exists());
        assert!(holder.info_path().exists());

        holder.release_lock();
        assert!(!cleaner.cleanup_stale_artifacts().unwrap());
    }

    #[test]
    fn test_store_mirror() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = SchedulerLockManager::new(
            dir.path(),
            Arc::new(FakeProcessInspector::new()),
            quick(),
        )
        .unwrap()
        .with_store(store.clone());

        assert!(manager.acquire_lock().unwrap());
        assert!(store.lock_holder(LOCK_NAME).unwrap().is_some());
        manager.release_lock();
        assert!(store.lock_holder(LOCK_NAME).unwrap().is_none());

        // A crashed holder's row goes with its files.
        let dead = SchedulerLockInfo {
            pid: 777,
            signature: "dead".to_string(),
            acquired_at: format_ts(&old()),
            hostname: "h".to_string(),
            exe: None,
            args: vec![],
            cwd: None,
        };
        fs::write(manager.info_path(), serde_json::to_string(&dead).unwrap()).unwrap();
        store
            .record_lock_holder(&LockHolderRecord {
                name: LOCK_NAME.to_string(),
                holder_pid: 777,
                hostname: "h".to_string(),
                signature: "dead".to_string(),
                acquired_at: dead.acquired_at.clone(),
            })
            .unwrap();
        assert!(manager.cleanup_stale_artifacts().unwrap());
        assert!(!manager.info_path().exists());
        assert!(store.lock_holder(LOCK_NAME).unwrap().is_none());
    }
}
