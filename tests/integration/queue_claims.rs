//! Claim ordering and claim races across connections.

use std::sync::{Arc, Barrier};
use std::thread;

use spool::queue::{ProjectStatus, QueueManager, StatusUpdate};

use crate::fixtures::TestHome;

/// Lower priority numbers are claimed first; FIFO within a priority.
#[test]
fn test_claim_order_priority_then_fifo() {
    let home = TestHome::new();
    let queue = home.queue();
    let x = queue.enqueue("specs/x.md", None, 5).unwrap().unwrap();
    let y = queue.enqueue("specs/y.md", None, 1).unwrap().unwrap();
    let z = queue.enqueue("specs/z.md", None, 5).unwrap().unwrap();

    let order: Vec<i64> = std::iter::from_fn(|| queue.claim_next().unwrap().map(|c| c.id)).collect();
    assert_eq!(order, vec![y, x, z]);
}

/// Many processes racing for one queued row: exactly one wins.
#[test]
fn test_concurrent_claims_single_winner() {
    let home = TestHome::new();
    let id = home.queue().enqueue("specs/only.md", None, 5).unwrap().unwrap();

    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let queue = home.queue();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                queue.claim_next().unwrap().map(|c| c.id)
            })
        })
        .collect();

    let winners: Vec<i64> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(winners, vec![id]);
    assert_eq!(
        home.queue().get_project(id).unwrap().unwrap().status,
        ProjectStatus::Processing
    );
}

/// Every queued row is claimed exactly once even with several claimers.
#[test]
fn test_concurrent_claims_never_double_claim() {
    let home = TestHome::new();
    let queue = home.queue();
    let mut expected: Vec<i64> = (0..20)
        .map(|i| {
            queue
                .enqueue(&format!("specs/{}.md", i), None, 5)
                .unwrap()
                .unwrap()
        })
        .collect();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue: QueueManager = home.queue();
            thread::spawn(move || {
                let mut mine = Vec::new();
                let mut idle_rounds = 0;
                // A busy store yields None; retry a few times before giving up.
                while idle_rounds < 50 {
                    match queue.claim_next().unwrap() {
                        Some(claimed) => {
                            mine.push(claimed.id);
                            idle_rounds = 0;
                        }
                        None => {
                            idle_rounds += 1;
                            thread::sleep(std::time::Duration::from_millis(5));
                        }
                    }
                }
                mine
            })
        })
        .collect();

    let mut claimed: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    claimed.sort_unstable();
    expected.sort_unstable();
    assert_eq!(claimed, expected);
}

/// A spec can only be queued once until its earlier row finishes.
#[test]
fn test_duplicate_enqueue_until_terminal() {
    let home = TestHome::new();
    let queue = home.queue();
    let first = queue.enqueue("specs/dup.md", None, 5).unwrap().unwrap();
    assert_eq!(queue.enqueue("specs/dup.md", None, 1).unwrap(), None);

    queue.claim_next().unwrap();
    assert_eq!(queue.enqueue("specs/dup.md", None, 5).unwrap(), None);

    queue
        .update_status(first, ProjectStatus::Completed, StatusUpdate::default())
        .unwrap();
    let second = queue.enqueue("specs/dup.md", None, 5).unwrap().unwrap();
    assert_ne!(first, second);
}

/// Every transition outside the table is rejected and leaves the row alone.
#[test]
fn test_illegal_transitions_leave_row_unchanged() {
    let home = TestHome::new();
    let queue = home.queue();
    for from in ProjectStatus::ALL {
        for to in ProjectStatus::ALL {
            if spool::queue::state::can_transition(from, to) {
                continue;
            }
            let spec = format!("specs/{}-{}.md", from, to);
            let id = queue.enqueue(&spec, None, 5).unwrap().unwrap();
            drive_to(&queue, id, from);

            assert!(queue.update_status(id, to, StatusUpdate::default()).is_err());
            assert_eq!(queue.get_project(id).unwrap().unwrap().status, from);
        }
    }
}

/// Walk a fresh row to `target` through legal transitions only.
fn drive_to(queue: &QueueManager, id: i64, target: ProjectStatus) {
    use ProjectStatus::*;
    let path: &[ProjectStatus] = match target {
        Queued => &[],
        Processing => &[Processing],
        TimingOut => &[Processing, TimingOut],
        Completed => &[Processing, Completed],
        Failed => &[Processing, Failed],
        Zombie => &[Processing, Zombie],
        Recovered => &[Processing, Recovered],
    };
    for &step in path {
        queue.update_status(id, step, StatusUpdate::default()).unwrap();
    }
}
