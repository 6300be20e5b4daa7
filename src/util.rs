//! Shared utility functions.

use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::task::spawn_blocking;

use crate::{Error, Result};

const CHILD_POLL: Duration = Duration::from_millis(20);

/// Run blocking store/tmux/process work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Run a command to completion, killing it if it outlives `timeout`.
///
/// External tools (tmux in particular) occasionally wedge; every shell-out
/// on the daemon path goes through here so a single hung call cannot stall
/// the loop.
pub fn output_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Timeout(timeout));
        }
        std::thread::sleep(CHILD_POLL);
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_end(&mut stdout)?;
    }
    if let Some(mut err) = child.stderr.take() {
        err.read_to_end(&mut stderr)?;
    }
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Fixed-width RFC 3339 timestamp; lexical order equals chronological order,
/// which the store relies on for `ORDER BY` and range filters.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Elapsed time between two instants, clamped at zero.
pub fn elapsed_between(start: &DateTime<Utc>, now: &DateTime<Utc>) -> Duration {
    (*now - *start).to_std().unwrap_or(Duration::ZERO)
}
