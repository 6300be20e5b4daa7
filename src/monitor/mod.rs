//! Periodic checks the daemon runs against the queue and the session host.

mod batch;
mod orphans;
mod recovery;
mod session;

pub use batch::{BatchProcessor, BatchSummary};
pub use orphans::{OrphanReaper, OrphanReport};
pub use recovery::{RebootRecovery, RecoveryCandidate, RecoveryConfig, RecoveryManager};
pub use session::{worker_marker, Liveness, SessionMonitor, SessionMonitorConfig};
