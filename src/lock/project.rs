//! Per-project advisory file locks.
//!
//! One file per project id under the lock directory. The OS lock on the open
//! file is what excludes other holders; the file itself is just the rendezvous
//! point and is removed on release.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt;

use crate::{slog, slog_debug, slog_warn, Error, Result};

const DEFAULT_POLL: Duration = Duration::from_millis(500);
const LOCK_PREFIX: &str = "project_";
const LOCK_SUFFIX: &str = ".lock";

/// Factory for project locks rooted at one directory.
#[derive(Debug, Clone)]
pub struct ProjectLocks {
    dir: PathBuf,
    poll: Duration,
}

impl ProjectLocks {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            poll: DEFAULT_POLL,
        })
    }

    /// Override the retry interval used while waiting for a held lock.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self, project_id: i64) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", LOCK_PREFIX, project_id, LOCK_SUFFIX))
    }

    /// Acquire the lock for `project_id`, polling until `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout expires with the lock still held
    /// elsewhere. A zero timeout makes exactly one attempt.
    pub fn acquire(&self, project_id: i64, timeout: Duration) -> Result<Option<ProjectLockGuard>> {
        let path = self.lock_path(project_id);
        let start = Instant::now();
        loop {
            if let Some(file) = try_lock_path(&path)? {
                slog_debug!("Acquired project lock {}", project_id);
                return Ok(Some(ProjectLockGuard {
                    file: Some(file),
                    path,
                    project_id,
                }));
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                slog_debug!(
                    "Project lock {} still held after {:?}",
                    project_id,
                    elapsed
                );
                return Ok(None);
            }
            std::thread::sleep(self.poll.min(timeout - elapsed));
        }
    }

    /// Whether some holder currently has the lock. Does not create the file.
    pub fn is_locked(&self, project_id: i64) -> bool {
        probe_held(&self.lock_path(project_id))
    }

    /// Remove lock files older than `max_age` that nobody holds.
    pub fn cleanup_stale_locks(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with(LOCK_PREFIX) && name.ends_with(LOCK_SUFFIX)) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or(Duration::ZERO);
            if age < max_age {
                continue;
            }
            let path = entry.path();
            // Only a file we can lock ourselves is unheld; delete it while
            // holding the lock so no one slips in between.
            match try_lock_path(&path) {
                Ok(Some(file)) => {
                    if let Err(e) = fs::remove_file(&path) {
                        slog_warn!("Failed to remove stale lock {}: {}", path.display(), e);
                    } else {
                        removed += 1;
                    }
                    let _ = FileExt::unlock(&file);
                }
                Ok(None) => slog_debug!("Lock {} is old but held, keeping", path.display()),
                Err(e) => slog_warn!("Failed to probe lock {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            slog!("Removed {} stale project lock files", removed);
        }
        Ok(removed)
    }
}

/// A held project lock. Released (and its file removed) on drop.
#[derive(Debug)]
pub struct ProjectLockGuard {
    file: Option<File>,
    path: PathBuf,
    project_id: i64,
}

impl ProjectLockGuard {
    pub fn project_id(&self) -> i64 {
        self.project_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly. Releasing twice is a no-op.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Unlink before unlocking: a waiter that then wins the old inode
        // notices it is unlinked and retries on the fresh path.
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                slog_warn!("Failed to remove lock file {}: {}", self.path.display(), e);
            }
        }
        let _ = FileExt::unlock(&file);
        slog_debug!("Released project lock {}", self.project_id);
    }
}

impl Drop for ProjectLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Run `f` while holding the project lock, failing with `LockTimeout` if it
/// cannot be taken within `timeout`.
pub fn with_project_lock<T>(
    locks: &ProjectLocks,
    project_id: i64,
    timeout: Duration,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let guard = locks
        .acquire(project_id, timeout)?
        .ok_or(Error::LockTimeout {
            id: project_id,
            waited: timeout,
        })?;
    let out = f();
    guard.release();
    out
}

/// Outcome of one non-blocking lock attempt on a path.
#[derive(Debug)]
pub(super) enum LockAttempt {
    /// Locked, and the locked inode is still the one at the path.
    Locked(File),
    Held,
    /// We locked an inode that was unlinked or replaced after we opened it.
    Unlinked,
    /// No file at the path and `create` was false.
    Missing,
}

pub(super) fn try_lock_file(path: &Path, create: bool) -> Result<LockAttempt> {
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if !create && e.kind() == io::ErrorKind::NotFound => {
            return Ok(LockAttempt::Missing)
        }
        Err(e) => return Err(e.into()),
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            if still_linked(&file, path) {
                Ok(LockAttempt::Locked(file))
            } else {
                // Previous holder removed the file after we opened it.
                let _ = FileExt::unlock(&file);
                Ok(LockAttempt::Unlinked)
            }
        }
        Err(e) if is_contended(&e) => Ok(LockAttempt::Held),
        Err(e) => Err(e.into()),
    }
}

/// One non-blocking attempt. `Ok(None)` means someone else holds it.
fn try_lock_path(path: &Path) -> Result<Option<File>> {
    match try_lock_file(path, true)? {
        LockAttempt::Locked(file) => Ok(Some(file)),
        _ => Ok(None),
    }
}

fn probe_held(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
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

pub(crate) fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(open), Ok(on_disk)) => open.dev() == on_disk.dev() && open.ino() == on_disk.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}
