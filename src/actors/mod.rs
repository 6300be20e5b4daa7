//! Background tasks run by the daemon.
//!
//! Each actor is an independent tokio task driven by an interval and stopped
//! through its [`ActorHandle`]. Actors do their store and process work on the
//! blocking pool so a slow `ps` or SQLite call never stalls the runtime.

pub mod process_monitor;

use tokio_util::sync::CancellationToken;

pub use process_monitor::{apply_report, ProcessMonitorActor};

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
}

impl ActorHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Signal the actor to stop after its current pass.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ActorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
