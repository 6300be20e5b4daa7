//! Project status transition rules.
//!
//! ```text
//! QUEUED --claim--> PROCESSING --ok------------> COMPLETED
//!                       |  \--near timeout--> TIMING_OUT --kill--> FAILED
//!                       |  \--husk session--> ZOMBIE -----------> FAILED
//!                       \--phantom/launch error-----------------> FAILED
//! PROCESSING | TIMING_OUT | ZOMBIE | FAILED --manual--> RECOVERED
//! RECOVERED --> PROCESSING | COMPLETED | FAILED
//! ```
//!
//! Terminal states only move again through an explicit recovery. Operator
//! resets (back to `queued`) are a separate path, see [`can_reset`].

use crate::error::{Error, Result};

use super::ProjectStatus;

/// Check whether `from -> to` is a legal status change.
pub fn can_transition(from: ProjectStatus, to: ProjectStatus) -> bool {
    use ProjectStatus::*;
    matches!(
        (from, to),
        (Queued, Processing)
            | (Processing, TimingOut)
            | (Processing, Completed)
            | (Processing, Zombie)
            | (Processing, Failed)
            | (Processing, Recovered)
            | (TimingOut, Failed)
            | (TimingOut, Recovered)
            | (Zombie, Failed)
            | (Zombie, Recovered)
            | (Failed, Recovered)
            | (Recovered, Processing)
            | (Recovered, Completed)
            | (Recovered, Failed)
    )
}

/// Validate a transition, producing the error callers surface.
pub fn check_transition(id: i64, from: ProjectStatus, to: ProjectStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            id,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// States an operator may reset back to `queued`.
///
/// Completed work is never re-run by a reset; recover it first if needed.
pub fn can_reset(from: ProjectStatus) -> bool {
    !matches!(from, ProjectStatus::Queued | ProjectStatus::Completed)
}

/// States from which `recover_project` may move a row to `recovered`.
pub fn can_recover(from: ProjectStatus) -> bool {
    can_transition(from, ProjectStatus::Recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProjectStatus::*;

    #[test]
    fn test_claim_transition() {
        assert!(can_transition(Queued, Processing));
        assert!(!can_transition(Queued, Completed));
        assert!(!can_transition(Queued, Failed));
    }

    #[test]
    fn test_processing_exits() {
        for to in [TimingOut, Completed, Zombie, Failed, Recovered] {
            assert!(can_transition(Processing, to), "processing -> {}", to);
        }
        assert!(!can_transition(Processing, Queued));
    }

    #[test]
    fn test_terminal_states_only_recover() {
        for to in ProjectStatus::ALL {
            assert!(!can_transition(Completed, to), "completed -> {}", to);
        }
        for to in ProjectStatus::ALL {
            assert_eq!(can_transition(Failed, to), to == Recovered, "failed -> {}", to);
        }
    }

    #[test]
    fn test_timing_out_and_zombie_end_failed() {
        assert!(can_transition(TimingOut, Failed));
        assert!(can_transition(Zombie, Failed));
        assert!(!can_transition(TimingOut, Completed));
        assert!(!can_transition(Zombie, Processing));
    }

    #[test]
    fn test_recovered_resumes() {
        assert!(can_transition(Recovered, Processing));
        assert!(can_transition(Recovered, Completed));
        assert!(can_transition(Recovered, Failed));
        assert!(!can_transition(Recovered, Queued));
    }

    #[test]
    fn test_no_self_transitions() {
        for status in ProjectStatus::ALL {
            assert!(!can_transition(status, status), "{} -> {}", status, status);
        }
    }

    #[test]
    fn test_check_transition_error() {
        let err = check_transition(9, Completed, Queued).unwrap_err();
        match err {
            Error::InvalidTransition { id, from, to } => {
                assert_eq!(id, 9);
                assert_eq!(from, "completed");
                assert_eq!(to, "queued");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reset_and_recover_sources() {
        assert!(can_reset(Failed));
        assert!(can_reset(Processing));
        assert!(!can_reset(Completed));
        assert!(!can_reset(Queued));
        assert!(can_recover(Zombie));
        assert!(can_recover(TimingOut));
        assert!(!can_recover(Completed));
        assert!(!can_recover(Queued));
    }
}
