//! Integration test suite for spool.
//!
//! These tests run the queue, locks, monitors and daemon loop against a real
//! SQLite file and real lock files in a temporary home. The session host and
//! the process table are the in-crate fakes from `spool::testing`, so no tmux
//! server or worker binary is needed.
//!
//! # Test Categories
//!
//! - `queue_claims`: claim ordering and races between connections
//! - `locks`: project locks and the scheduler singleton
//! - `recovery`: phantom sweeps, runtime limits and reboot recovery
//! - `daemon`: full ticks of the scheduler loop

mod fixtures;

mod daemon;
mod locks;
mod queue_claims;
mod recovery;
