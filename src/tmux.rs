use std::path::Path;
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::util::output_with_timeout;
use crate::{slog_debug, slog_trace, slog_warn, Error, Result};

const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// A session as reported by the session host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSession {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

/// A window inside a session and the foreground command of its active pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostWindow {
    pub index: u32,
    pub name: String,
    pub current_command: String,
}

/// The narrow capability set the queue engine needs from a terminal
/// multiplexer. Monitors and the launcher only ever talk to this trait.
pub trait SessionHost: Send + Sync {
    fn create_session(&self, name: &str, cwd: &Path, cmd: &[String]) -> Result<()>;
    fn list_sessions(&self) -> Result<Vec<HostSession>>;
    fn list_windows(&self, session: &str) -> Result<Vec<HostWindow>>;
    fn send_keys(&self, target: &str, keys: &str) -> Result<()>;
    fn capture_pane(&self, target: &str, lines: u16) -> Result<String>;
    fn session_exists(&self, name: &str) -> bool;
    fn kill_session(&self, name: &str) -> Result<()>;
    /// PID of the process running in the session's first pane.
    fn pane_pid(&self, session: &str) -> Result<Option<u32>>;
}

/// `SessionHost` backed by the `tmux` CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tmux;

impl Tmux {
    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    fn run(args: &[&str]) -> Result<std::process::Output> {
        slog_trace!("tmux {}", args.join(" "));
        output_with_timeout(Command::new("tmux").args(args), TMUX_TIMEOUT)
    }

    fn run_checked(args: &[&str], what: &str) -> Result<String> {
        let output = Self::run(args)?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "{} failed: {}",
                what,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl SessionHost for Tmux {
    fn create_session(&self, name: &str, cwd: &Path, cmd: &[String]) -> Result<()> {
        if cmd.is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }

        let cmd_str = cmd
            .iter()
            .map(|s| shell_escape(s))
            .collect::<Vec<_>>()
            .join(" ");
        slog_debug!(
            "Tmux::create_session name={} cwd={} cmd={}",
            name,
            cwd.display(),
            cmd_str
        );
        let cwd_str = cwd.display().to_string();
        if let Err(e) = Self::run_checked(
            &["new-session", "-d", "-s", name, "-c", &cwd_str, &cmd_str],
            &format!("create session '{}'", name),
        ) {
            slog_warn!("tmux create_session failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<HostSession>> {
        let output = Self::run(&[
            "list-sessions",
            "-F",
            "#{session_name}\t#{session_created}",
        ])?;
        if !output.status.success() {
            // No server running means no sessions.
            slog_trace!("tmux list-sessions: no server");
            return Ok(Vec::new());
        }
        Ok(parse_sessions(&String::from_utf8_lossy(&output.stdout)))
    }

    fn list_windows(&self, session: &str) -> Result<Vec<HostWindow>> {
        let stdout = Self::run_checked(
            &[
                "list-windows",
                "-t",
                session,
                "-F",
                "#{window_index}\t#{window_name}\t#{pane_current_command}",
            ],
            &format!("list windows of '{}'", session),
        )?;
        Ok(parse_windows(&stdout))
    }

    fn send_keys(&self, target: &str, keys: &str) -> Result<()> {
        slog_debug!("Tmux::send_keys target={} keys={}", target, keys);
        Self::run_checked(
            &["send-keys", "-t", target, keys, "Enter"],
            &format!("send keys to '{}'", target),
        )?;
        Ok(())
    }

    fn capture_pane(&self, target: &str, lines: u16) -> Result<String> {
        let start = format!("-{}", lines);
        Self::run_checked(
            &["capture-pane", "-t", target, "-p", "-S", &start],
            &format!("capture pane '{}'", target),
        )
    }

    fn session_exists(&self, name: &str) -> bool {
        Self::run(&["has-session", "-t", name])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        slog_debug!("Tmux::kill_session name={}", name);
        let output = Self::run(&["kill-session", "-t", name])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("can't find session") || stderr.contains("session not found") {
                slog_debug!("Tmux session '{}' already gone", name);
                return Ok(());
            }
            return Err(Error::Tmux(format!(
                "Failed to kill session '{}': {}",
                name,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn pane_pid(&self, session: &str) -> Result<Option<u32>> {
        let stdout = Self::run_checked(
            &["display-message", "-p", "-t", session, "#{pane_pid}"],
            &format!("read pane pid of '{}'", session),
        )?;
        Ok(stdout.trim().parse::<u32>().ok())
    }
}

fn parse_sessions(stdout: &str) -> Vec<HostSession> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut parts = line.splitn(2, '\t');
            let name = parts.next().unwrap_or_default().to_string();
            let created = parts
                .next()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
            HostSession { name, created }
        })
        .collect()
}

fn parse_windows(stdout: &str) -> Vec<HostWindow> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let index = parts.next()?.trim().parse::<u32>().ok()?;
            let name = parts.next().unwrap_or_default().to_string();
            let current_command = parts.next().unwrap_or_default().trim().to_string();
            Some(HostWindow {
                index,
                name,
                current_command,
            })
        })
        .collect()
}

fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '='))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
