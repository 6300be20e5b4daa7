pub mod config;
pub mod error;
pub mod log;
pub mod store;
pub mod tmux;
pub mod util;

// Queue, locks and supervision
pub mod events;
pub mod launcher;
pub mod lock;
pub mod monitor;
pub mod process;
pub mod queue;

// Daemon
pub mod actors;
pub mod daemon;

pub mod testing;

pub use error::{Error, Result};
pub use queue::{Project, ProjectStatus, QueueManager};
