use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;

use spool::config::Config;
use spool::daemon::{run_daemon, CoreScheduler};
use spool::events::read_audit_log;
use spool::launcher::send_to_worker;
use spool::lock::{with_project_lock, ProjectLocks, SchedulerLockConfig, SchedulerLockManager};
use spool::process::{ProcessInspector, SystemInspector};
use spool::queue::{MergedStatus, ProjectStatus, QueueManager, StatusUpdate, DEFAULT_PRIORITY};
use spool::store::Store;
use spool::tmux::{SessionHost, Tmux};
use spool::{slog, Error, Result};

/// How long CLI commands wait for a project lock held by the daemon.
const CLI_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Spool - persistent job queue and supervisor for agent sessions in tmux
#[derive(Parser, Debug)]
#[command(name = "spool")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    SPOOL_HOME=DIR  State directory (default ~/.spool)\n    SPOOL_DEBUG=1   Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to <home>/spool.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the scheduler daemon in the foreground
    Daemon,

    /// Show queue counts and active projects
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a spec to the queue
    Enqueue {
        /// Path to the spec file
        spec: String,

        /// Working directory for the worker
        #[arg(long)]
        project: Option<String>,

        /// Lower numbers run first
        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: i64,
    },

    /// Move a project to a new status (workers report completion with this)
    SetStatus {
        id: i64,
        status: ProjectStatus,

        /// Notes stored with the transition
        #[arg(long)]
        notes: Option<String>,
    },

    /// Register extra sessions a worker opened, so monitors and recovery see them
    Sessions {
        id: i64,

        #[arg(long)]
        main: Option<String>,

        #[arg(long)]
        orchestrator: Option<String>,
    },

    /// Type a line into a running worker's session
    Send { id: i64, text: String },

    /// Put a project back in the queue, stopping anything it left running
    Reset { id: i64 },

    /// Delete a project that is not running
    Remove { id: i64 },

    /// Stop a stuck project and mark it recovered
    Recover {
        id: i64,

        #[arg(long, default_value = "manual recovery")]
        reason: String,
    },

    /// Remove stale lock files and, optionally, old finished projects
    CleanupStale {
        /// Unheld project locks older than this are removed
        #[arg(long, default_value_t = 1)]
        max_age_hours: u64,

        /// Also delete finished projects older than this many days
        #[arg(long)]
        days: Option<u32>,
    },

    /// Record the merge outcome of a completed project
    MergeStatus { id: i64, status: MergedStatus },

    /// Show recent events from the audit log
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    spool::log::init_with_debug(&config.home_dir()?, cli.debug);
    slog!("Command: {:?}", cli.command);

    match cli.command {
        Command::Daemon => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_daemon(config))
        }
        Command::Status { json } => run_status(&config, json),
        Command::Enqueue {
            spec,
            project,
            priority,
        } => run_enqueue(&config, &spec, project.as_deref(), priority),
        Command::SetStatus { id, status, notes } => run_set_status(&config, id, status, notes),
        Command::Sessions {
            id,
            main,
            orchestrator,
        } => {
            if main.is_none() && orchestrator.is_none() {
                return Err(Error::Validation(
                    "pass --main and/or --orchestrator".to_string(),
                ));
            }
            open_queue(&config)?.set_auxiliary_sessions(
                id,
                main.as_deref(),
                orchestrator.as_deref(),
            )?;
            println!("Project {} sessions updated", id);
            Ok(())
        }
        Command::Send { id, text } => {
            let session = send_to_worker(&open_queue(&config)?, &Tmux, id, &text)?;
            println!("Sent to {}", session);
            Ok(())
        }
        Command::Reset { id } => run_reset(&config, id),
        Command::Remove { id } => run_remove(&config, id),
        Command::Recover { id, reason } => run_recover(config, id, &reason),
        Command::CleanupStale {
            max_age_hours,
            days,
        } => run_cleanup_stale(&config, max_age_hours, days),
        Command::MergeStatus { id, status } => {
            open_queue(&config)?.set_merged_status(id, status)?;
            println!("Project {} merge status: {}", id, status);
            Ok(())
        }
        Command::Events { limit } => run_events(&config, limit),
    }
}

fn open_queue(config: &Config) -> Result<QueueManager> {
    config.ensure_dirs()?;
    Ok(QueueManager::new(Arc::new(Store::open(&config.db_path()?)?)))
}

fn run_status(config: &Config, as_json: bool) -> Result<()> {
    let queue = open_queue(config)?;
    let counts = queue.get_queue_status()?;
    let active = queue.get_active_projects()?;

    if as_json {
        let out = json!({"counts": counts.by_status, "active": active});
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let summary: Vec<String> = ProjectStatus::ALL
        .iter()
        .map(|s| format!("{}={}", s, counts.get(*s)))
        .collect();
    println!("Queue: {}", summary.join(" "));
    if active.is_empty() {
        println!("No active projects");
    }
    let now = chrono::Utc::now();
    for project in active {
        let runtime = project
            .runtime_at(now)
            .map(|d| format!("{}m", d.as_secs() / 60))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  #{} {} [{}] {} session={}",
            project.id,
            project.spec_path,
            project.status,
            runtime,
            project.session_name.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn run_enqueue(config: &Config, spec: &str, project: Option<&str>, priority: i64) -> Result<()> {
    match open_queue(config)?.enqueue(spec, project, priority)? {
        Some(id) => {
            println!("Enqueued project {} ({})", id, spec);
            Ok(())
        }
        None => Err(Error::DuplicateProject(spec.to_string())),
    }
}

fn run_set_status(
    config: &Config,
    id: i64,
    status: ProjectStatus,
    notes: Option<String>,
) -> Result<()> {
    let mut update = StatusUpdate::default();
    if let Some(notes) = notes {
        update = update.notes(notes);
    }
    let project = open_queue(config)?.update_status(id, status, update)?;
    println!("Project {} is now {}", id, project.status);
    Ok(())
}

fn run_reset(config: &Config, id: i64) -> Result<()> {
    let queue = open_queue(config)?;
    let locks = ProjectLocks::new(&config.lock_dir()?)?;
    let project = with_project_lock(&locks, id, CLI_LOCK_TIMEOUT, || {
        let current = queue.get_project(id)?.ok_or(Error::ProjectNotFound(id))?;
        let tmux = Tmux;
        for session in current.sessions() {
            if tmux.session_exists(session) {
                tmux.kill_session(session)?;
            }
        }
        if let Some(pid) = current.process_pid {
            let inspector = SystemInspector;
            if inspector.is_alive(pid) {
                inspector.terminate(pid);
            }
        }
        queue.reset_project(id)
    })?;
    println!("Project {} reset to {}", id, project.status);
    Ok(())
}

fn run_remove(config: &Config, id: i64) -> Result<()> {
    if open_queue(config)?.remove_project(id)? {
        println!("Removed project {}", id);
        Ok(())
    } else {
        Err(Error::ProjectNotFound(id))
    }
}

fn run_recover(config: Config, id: i64, reason: &str) -> Result<()> {
    let scheduler = CoreScheduler::open(config)?;
    if scheduler.recovery().recover_project(id, reason)? {
        println!("Project {} recovered", id);
        Ok(())
    } else {
        let status = scheduler
            .queue()
            .get_project(id)?
            .map(|p| p.status.to_string())
            .unwrap_or_else(|| "missing".to_string());
        Err(Error::Validation(format!(
            "project {} cannot be recovered from {}",
            id, status
        )))
    }
}

fn run_cleanup_stale(config: &Config, max_age_hours: u64, days: Option<u32>) -> Result<()> {
    config.ensure_dirs()?;
    let lock_dir = config.lock_dir()?;
    let removed = ProjectLocks::new(&lock_dir)?
        .cleanup_stale_locks(Duration::from_secs(max_age_hours * 60 * 60))?;
    println!("Removed {} stale project lock(s)", removed);

    let singleton = SchedulerLockManager::new(
        &lock_dir,
        Arc::new(SystemInspector),
        SchedulerLockConfig::default(),
    )?;
    if singleton.cleanup_stale_artifacts()? {
        println!("Removed stale scheduler lock");
    }

    if let Some(days) = days {
        let pruned = open_queue(config)?.cleanup_old(days)?;
        println!("Deleted {} finished project(s) older than {} days", pruned, days);
    }
    Ok(())
}

fn run_events(config: &Config, limit: usize) -> Result<()> {
    let path = config.event_log_path()?;
    if !path.exists() {
        println!("No events recorded");
        return Ok(());
    }
    for event in read_audit_log(&path, limit)? {
        println!(
            "{} {} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type.as_str(),
            event.data
        );
    }
    Ok(())
}
