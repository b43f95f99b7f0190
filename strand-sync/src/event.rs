//! Manual-reset event: a broadcast signal.
//!
//! `notify_all` latches the event and wakes every waiter; new waits complete
//! immediately until `reset` clears the flag. Note that `notify_all`
//! followed by `reset` from outside the strand may be observed in either
//! order; callers that need "latch, observe, then clear" must sequence via
//! a wait (or the [`Event::is_set`] query) before re-arming.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use strand_core::{
    BoolCompletion, Completion, Deadline, Executor, RaceArbiter, Strand, SyncError, SyncResult,
};

/// Cloneable handle to a manual-reset event.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

struct Inner {
    strand: Strand,
    state: parking_lot::Mutex<State>,
}

struct State {
    is_set: bool,
    waiters: VecDeque<Completion>,
}

impl Event {
    /// Create an event with its own strand on `executor`.
    pub fn new(executor: &Executor) -> Self {
        Self::with_strand(Strand::new(executor))
    }

    /// Create an event over an existing strand.
    pub fn with_strand(strand: Strand) -> Self {
        Self {
            inner: Arc::new(Inner {
                strand,
                state: parking_lot::Mutex::new(State {
                    is_set: false,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// The strand this event serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Wait for the event; completes immediately if it is already set.
    pub fn wait_with(&self, completion: impl FnOnce() + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if state.is_set {
                drop(state);
                completion();
            } else {
                state.waiters.push_back(Box::new(completion));
            }
        });
    }

    /// Timed wait; the completion receives `true` if the event was set
    /// before `timeout` elapsed.
    pub fn wait_for_with(&self, timeout: Duration, completion: impl FnOnce(bool) + Send + 'static) {
        let race: Arc<RaceArbiter<BoolCompletion>> = RaceArbiter::new(Box::new(completion));
        let deadline = Arc::new(Deadline::new(self.inner.strand.executor()));

        {
            let race = Arc::clone(&race);
            deadline.arm(
                timeout,
                Box::new(move || {
                    if let Some(completion) = race.win() {
                        completion(false);
                    }
                }),
            );
        }

        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            let wake = Box::new(move || {
                if let Some(completion) = race.win() {
                    deadline.cancel();
                    completion(true);
                }
            });
            if state.is_set {
                drop(state);
                wake();
            } else {
                // A wait that times out stays queued with its race decided;
                // the eventual notify fires it as a no-op.
                state.waiters.push_back(wake);
            }
        });
    }

    /// Set the event and wake every waiter. A no-op if already set.
    pub fn notify_all(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if state.is_set {
                return;
            }
            state.is_set = true;
            let woken: Vec<Completion> = state.waiters.drain(..).collect();
            drop(state);
            for completion in woken {
                completion();
            }
        });
    }

    /// Clear the event. Does not affect waiters queued before the clear is
    /// observed.
    pub fn reset(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            inner.state.lock().is_set = false;
        });
    }

    /// Await the event.
    pub async fn wait(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wait_with(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Await the event for at most `timeout`; `Ok(false)` on timeout.
    pub async fn wait_for(&self, timeout: Duration) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.wait_for_with(timeout, move |set| {
            let _ = tx.send(set);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Snapshot of the set flag.
    pub async fn is_set(&self) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let is_set = inner.state.lock().is_set;
            let _ = tx.send(is_set);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Snapshot of the number of queued waiters.
    pub async fn waiting_count(&self) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let waiting = inner.state.lock().waiters.len();
            let _ = tx.send(waiting);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }
}
