use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{slog_debug, slog_warn, Error, Result};

/// Daemon and CLI configuration.
///
/// Loaded from `<home>/spool.toml` when present, then overridden field by
/// field from `SPOOL_*` environment variables. Every field has a default so an
/// empty file (or none at all) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding the database, lock files, event log and daemon log.
    pub home: Option<String>,
    pub poll_interval_secs: u64,
    pub max_concurrent: usize,
    pub max_runtime_secs: u64,
    pub process_monitor_interval_secs: u64,
    pub startup_grace_secs: u64,
    pub phantom_grace_secs: u64,
    pub phantom_check_interval_secs: u64,
    pub state_sync_interval_secs: u64,
    pub orphan_check_interval_secs: u64,
    pub orphan_min_age_secs: u64,
    pub reboot_uptime_threshold_secs: u64,
    pub recovery_cooldown_secs: u64,
    pub long_running_secs: u64,
    pub retention_days: u32,
    /// Executable launched per project; spec path and project path are appended.
    pub worker_command: String,
    /// Prefix shared by every tmux session the daemon creates.
    pub session_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: None,
            poll_interval_secs: 10,
            max_concurrent: 1,
            max_runtime_secs: 3 * 60 * 60,
            process_monitor_interval_secs: 30,
            startup_grace_secs: 60,
            phantom_grace_secs: 30 * 60,
            phantom_check_interval_secs: 5 * 60,
            state_sync_interval_secs: 2 * 60,
            orphan_check_interval_secs: 10 * 60,
            orphan_min_age_secs: 60 * 60,
            reboot_uptime_threshold_secs: 10 * 60,
            recovery_cooldown_secs: 5 * 60,
            long_running_secs: 2 * 60 * 60,
            retention_days: 30,
            worker_command: "claude".to_string(),
            session_prefix: "spool_".to_string(),
        }
    }
}

impl Config {
    /// Default home: `$SPOOL_HOME` or `~/.spool`.
    pub fn default_home() -> Result<PathBuf> {
        if let Ok(home) = std::env::var("SPOOL_HOME") {
            if !home.is_empty() {
                return Ok(expand_tilde(&home));
            }
        }
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".spool"))
    }

    /// Configuration rooted at an explicit directory, with all other defaults.
    pub fn with_home(home: &Path) -> Self {
        Self {
            home: Some(home.display().to_string()),
            ..Default::default()
        }
    }

    pub fn home_dir(&self) -> Result<PathBuf> {
        match &self.home {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::default_home(),
        }
    }

    pub fn config_path(&self) -> Result<PathBuf> {
        Ok(self.home_dir()?.join("spool.toml"))
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.home_dir()?.join("queue.db"))
    }

    pub fn lock_dir(&self) -> Result<PathBuf> {
        Ok(self.home_dir()?.join("locks"))
    }

    pub fn event_log_path(&self) -> Result<PathBuf> {
        Ok(self.home_dir()?.join("events.jsonl"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn process_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.process_monitor_interval_secs.max(1))
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn phantom_grace(&self) -> Duration {
        Duration::from_secs(self.phantom_grace_secs)
    }

    /// Load `<default home>/spool.toml` and apply environment overrides.
    pub fn load() -> Result<Self> {
        let home = Self::default_home()?;
        Self::load_from(&home)
    }

    pub fn load_from(home: &Path) -> Result<Self> {
        let path = home.join("spool.toml");
        slog_debug!("Config::load path={}", path.display());
        let mut config = if path.exists() {
            toml::from_str(&fs::read_to_string(&path)?)?
        } else {
            slog_debug!("Config file not found, using defaults");
            Self::default()
        };
        if config.home.is_none() {
            config.home = Some(home.display().to_string());
        }
        config.apply_env(std::env::vars());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let home = self.home_dir()?;
        fs::create_dir_all(&home)?;
        let path = self.config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        slog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.home_dir()?)?;
        fs::create_dir_all(self.lock_dir()?)?;
        Ok(())
    }

    /// Apply `SPOOL_*` overrides. Unparseable values are logged and skipped.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let value = value.trim();
            match key.as_str() {
                "SPOOL_POLL_INTERVAL" => set_parsed(&key, value, &mut self.poll_interval_secs),
                "SPOOL_MAX_CONCURRENT" => set_parsed(&key, value, &mut self.max_concurrent),
                "SPOOL_MAX_RUNTIME" => set_parsed(&key, value, &mut self.max_runtime_secs),
                "SPOOL_MONITOR_INTERVAL" => {
                    set_parsed(&key, value, &mut self.process_monitor_interval_secs)
                }
                "SPOOL_STARTUP_GRACE" => set_parsed(&key, value, &mut self.startup_grace_secs),
                "SPOOL_PHANTOM_GRACE" => set_parsed(&key, value, &mut self.phantom_grace_secs),
                "SPOOL_PHANTOM_INTERVAL" => {
                    set_parsed(&key, value, &mut self.phantom_check_interval_secs)
                }
                "SPOOL_STATE_SYNC_INTERVAL" => {
                    set_parsed(&key, value, &mut self.state_sync_interval_secs)
                }
                "SPOOL_ORPHAN_INTERVAL" => {
                    set_parsed(&key, value, &mut self.orphan_check_interval_secs)
                }
                "SPOOL_ORPHAN_MIN_AGE" => set_parsed(&key, value, &mut self.orphan_min_age_secs),
                "SPOOL_REBOOT_THRESHOLD" => {
                    set_parsed(&key, value, &mut self.reboot_uptime_threshold_secs)
                }
                "SPOOL_RECOVERY_COOLDOWN" => {
                    set_parsed(&key, value, &mut self.recovery_cooldown_secs)
                }
                "SPOOL_LONG_RUNNING" => set_parsed(&key, value, &mut self.long_running_secs),
                "SPOOL_RETENTION_DAYS" => set_parsed(&key, value, &mut self.retention_days),
                "SPOOL_WORKER_COMMAND" if !value.is_empty() => {
                    self.worker_command = value.to_string()
                }
                "SPOOL_SESSION_PREFIX" if !value.is_empty() => {
                    self.session_prefix = value.to_string()
                }
                _ => {}
            }
        }
    }
}

fn set_parsed<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => slog_warn!("Ignoring {}={:?}: not a valid number", key, value),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
