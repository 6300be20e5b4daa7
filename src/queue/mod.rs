//! The project queue: row types, the status state machine and the manager
//! that applies both to the shared store.

mod manager;
pub mod state;
mod types;

pub use manager::{QueueCounts, QueueManager, StatusUpdate, DEFAULT_PRIORITY};
pub use types::{ClaimedProject, MergedStatus, Project, ProjectStatus};
