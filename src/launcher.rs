//! Starts a worker for a claimed project inside its own session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::process::ProcessManager;
use crate::queue::{ClaimedProject, ProjectStatus, QueueManager, StatusUpdate};
use crate::tmux::SessionHost;
use crate::{slog, slog_error, slog_warn, Error, Result};

/// Where a launched worker ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub session_name: String,
    pub pid: Option<u32>,
}

pub struct WorkerLauncher {
    host: Arc<dyn SessionHost>,
    queue: Arc<QueueManager>,
    processes: Arc<ProcessManager>,
    command: Vec<String>,
    session_prefix: String,
}

impl WorkerLauncher {
    pub fn new(
        host: Arc<dyn SessionHost>,
        queue: Arc<QueueManager>,
        processes: Arc<ProcessManager>,
        worker_command: &str,
        session_prefix: &str,
    ) -> Self {
        Self {
            host,
            queue,
            processes,
            command: worker_command
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            session_prefix: session_prefix.to_string(),
        }
    }

    pub fn session_name(&self, project_id: i64) -> String {
        format!("{}{}", self.session_prefix, project_id)
    }

    /// Whether the worker executable can be found on `PATH`.
    pub fn worker_available(&self) -> bool {
        self.command
            .first()
            .is_some_and(|program| which::which(program).is_ok())
    }

    /// Full argv for a project: worker command, spec path, then project path.
    pub fn command_for(&self, project: &ClaimedProject) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push(project.spec_path.clone());
        if let Some(path) = &project.project_path {
            argv.push(path.clone());
        }
        argv
    }

    fn working_dir(project: &ClaimedProject) -> PathBuf {
        if let Some(path) = &project.project_path {
            return PathBuf::from(path);
        }
        Path::new(&project.spec_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Launch the worker and record it. On failure the row is marked failed
    /// and any half-created session is removed.
    pub fn launch(&self, project: &ClaimedProject) -> Result<Launched> {
        match self.try_launch(project) {
            Ok(launched) => Ok(launched),
            Err(e) => {
                slog_error!("Launch of project {} failed: {}", project.id, e);
                let session = self.session_name(project.id);
                if self.host.session_exists(&session) {
                    let _ = self.host.kill_session(&session);
                }
                if let Err(update_err) = self.queue.update_status(
                    project.id,
                    ProjectStatus::Failed,
                    StatusUpdate::default().notes(format!("launch failed: {}", e)),
                ) {
                    slog_warn!(
                        "Could not mark project {} failed: {}",
                        project.id,
                        update_err
                    );
                }
                Err(Error::Launch(e.to_string()))
            }
        }
    }

    fn try_launch(&self, project: &ClaimedProject) -> Result<Launched> {
        if self.command.is_empty() {
            return Err(Error::Validation("worker command is empty".to_string()));
        }
        let session_name = self.session_name(project.id);
        if self.host.session_exists(&session_name) {
            // Leftover from an earlier attempt at the same row.
            slog_warn!("Replacing stale session {}", session_name);
            self.host.kill_session(&session_name)?;
        }

        let argv = self.command_for(project);
        let cwd = Self::working_dir(project);
        self.host.create_session(&session_name, &cwd, &argv)?;
        let pid = self.host.pane_pid(&session_name).unwrap_or_else(|e| {
            slog_warn!("No pane pid for {}: {}", session_name, e);
            None
        });

        self.queue.attach_session(project.id, &session_name, pid)?;
        if let Some(pid) = pid {
            self.processes.register(project.id, pid, &argv.join(" "));
        }
        slog!(
            "Launched project {} in session {} (pid {:?})",
            project.id,
            session_name,
            pid
        );
        Ok(Launched { session_name, pid })
    }
}

/// Type `text` into a running project's worker session, followed by Enter.
///
/// Returns the session the keys went to.
pub fn send_to_worker(
    queue: &QueueManager,
    host: &dyn SessionHost,
    project_id: i64,
    text: &str,
) -> Result<String> {
    let project = queue
        .get_project(project_id)?
        .ok_or(Error::ProjectNotFound(project_id))?;
    if !project.status.is_active() {
        return Err(Error::Validation(format!(
            "project {} is {}; no worker to send to",
            project_id, project.status
        )));
    }
    let session = project.session_name.ok_or_else(|| {
        Error::Validation(format!("project {} has no session yet", project_id))
    })?;
    host.send_keys(&session, text)?;
    slog!(
        "Sent {} bytes to project {} ({})",
        text.len(),
        project_id,
        session
    );
    Ok(session)
}
