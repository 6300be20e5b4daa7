//! OS process inspection.
//!
//! Everything that asks "is this pid alive / what is it running" goes
//! through [`ProcessInspector`], so the monitors and the scheduler lock can
//! be exercised against a fake process table.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, RefreshKind, Signal,
    System, UpdateKind,
};

use crate::slog_trace;

/// Snapshot of one OS process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: Vec<String>,
    pub exe: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub start_time: Option<DateTime<Utc>>,
    pub zombie: bool,
}

impl ProcessInfo {
    pub fn new(pid: u32, cmdline: &[&str]) -> Self {
        Self {
            pid,
            cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
            exe: None,
            cwd: None,
            start_time: None,
            zombie: false,
        }
    }

    pub fn started_at(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn command_line(&self) -> String {
        self.cmdline.join(" ")
    }

    /// Alive in the sense that matters here: present and not a zombie.
    pub fn is_running(&self) -> bool {
        !self.zombie
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.start_time
            .map(|start| crate::util::elapsed_between(&start, &now))
    }

    fn from_sysinfo(pid: Pid, process: &Process) -> Self {
        Self {
            pid: pid.as_u32(),
            cmdline: process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
            exe: process.exe().map(|p| p.to_path_buf()),
            cwd: process.cwd().map(|p| p.to_path_buf()),
            start_time: Utc.timestamp_opt(process.start_time() as i64, 0).single(),
            zombie: matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        }
    }
}

pub trait ProcessInspector: Send + Sync {
    fn process(&self, pid: u32) -> Option<ProcessInfo>;
    fn list(&self) -> Vec<ProcessInfo>;
    /// Ask the process to exit (SIGTERM where supported).
    fn terminate(&self, pid: u32) -> bool;
    /// Kill outright (SIGKILL).
    fn kill(&self, pid: u32) -> bool;
    /// Time since the host booted.
    fn uptime(&self) -> Duration;

    fn is_alive(&self, pid: u32) -> bool {
        self.process(pid).is_some_and(|p| p.is_running())
    }
}

/// [`ProcessInspector`] over the live process table via `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInspector;

impl SystemInspector {
    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_exe(UpdateKind::OnlyIfNotSet)
            .with_cwd(UpdateKind::OnlyIfNotSet)
    }

    fn load(pids: ProcessesToUpdate<'_>) -> System {
        let mut system = System::new_with_specifics(RefreshKind::nothing());
        system.refresh_processes_specifics(pids, true, Self::refresh_kind());
        system
    }
}

impl ProcessInspector for SystemInspector {
    fn process(&self, pid: u32) -> Option<ProcessInfo> {
        let pid = Pid::from_u32(pid);
        let system = Self::load(ProcessesToUpdate::Some(&[pid]));
        system
            .process(pid)
            .map(|process| ProcessInfo::from_sysinfo(pid, process))
    }

    fn list(&self) -> Vec<ProcessInfo> {
        let system = Self::load(ProcessesToUpdate::All);
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo::from_sysinfo(*pid, process))
            .collect()
    }

    fn terminate(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let system = Self::load(ProcessesToUpdate::Some(&[pid]));
        match system.process(pid) {
            Some(process) => {
                slog_trace!("SIGTERM pid {}", pid);
                process.kill_with(Signal::Term).unwrap_or_else(|| process.kill())
            }
            None => false,
        }
    }

    fn kill(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let system = Self::load(ProcessesToUpdate::Some(&[pid]));
        match system.process(pid) {
            Some(process) => {
                slog_trace!("SIGKILL pid {}", pid);
                process.kill()
            }
            None => false,
        }
    }

    fn uptime(&self) -> Duration {
        Duration::from_secs(System::uptime())
    }
}
