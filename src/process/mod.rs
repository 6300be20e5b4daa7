//! Worker process inspection and lifecycle.

mod inspect;
mod manager;

pub use inspect::{ProcessInfo, ProcessInspector, SystemInspector};
pub use manager::{MonitorReport, ProcessManager, TrackedProcess, DEFAULT_TERM_GRACE};
