//! Exactly-once arbitration for timed waits.
//!
//! Every timed operation in the workspace races an inner operation against a
//! [`crate::Deadline`]. Both finishers share one arbiter; whichever calls
//! [`RaceArbiter::win`] first receives the completion and is responsible for
//! cancelling the other side. The loser observes `None` and exits without
//! invoking anything, which makes the completion exactly-once under every
//! interleaving, including "the timer fires at the same instant the inner
//! operation completes".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared state of a two-finisher race over a one-shot completion `C`.
pub struct RaceArbiter<C> {
    completed: AtomicBool,
    slot: Mutex<Option<C>>,
}

impl<C: Send> RaceArbiter<C> {
    pub fn new(completion: C) -> Arc<Self> {
        Arc::new(Self {
            completed: AtomicBool::new(false),
            slot: Mutex::new(Some(completion)),
        })
    }

    /// First caller wins and takes the completion; every later caller gets
    /// `None`.
    pub fn win(&self) -> Option<C> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.slot.lock().take()
    }

    /// Whether either side has already won.
    pub fn is_decided(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn only_first_caller_wins() {
        let arbiter = RaceArbiter::new(42u32);
        assert!(!arbiter.is_decided());
        assert_eq!(arbiter.win(), Some(42));
        assert_eq!(arbiter.win(), None);
        assert!(arbiter.is_decided());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_racers_get_exactly_one_win() {
        for _ in 0..200 {
            let arbiter = RaceArbiter::new(());
            let wins = Arc::new(AtomicUsize::new(0));
            let mut joins = Vec::new();
            for _ in 0..8 {
                let arbiter = Arc::clone(&arbiter);
                let wins = Arc::clone(&wins);
                joins.push(tokio::spawn(async move {
                    if arbiter.win().is_some() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            for join in joins {
                join.await.unwrap();
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
        }
    }
}
