//! Bidirectional task counter, in the style of Go's `sync.WaitGroup`.
//!
//! Unlike the latch, the count can grow again after shrinking. `add` runs
//! through the strand so it serializes with concurrent `wait` registration:
//! a wait that observes a non-zero count is guaranteed to be queued before
//! any later `add` can drain, closing the add-after-wait race window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

use strand_core::{
    BoolCompletion, Completion, Deadline, Executor, RaceArbiter, Strand, SyncError, SyncResult,
};

/// Cloneable handle to a wait-group.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

struct Inner {
    strand: Strand,
    /// Mutated only inside the strand; atomic so `count()` can snapshot it
    /// from anywhere.
    count: AtomicI64,
    waiters: parking_lot::Mutex<VecDeque<Completion>>,
}

impl WaitGroup {
    /// Create a wait-group with its own strand on `executor`.
    pub fn new(executor: &Executor, initial: i64) -> SyncResult<Self> {
        Self::with_strand(Strand::new(executor), initial)
    }

    /// Create a wait-group over an existing strand.
    pub fn with_strand(strand: Strand, initial: i64) -> SyncResult<Self> {
        if initial < 0 {
            return Err(SyncError::InvalidArgument(
                "wait-group count must be non-negative".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                strand,
                count: AtomicI64::new(initial),
                waiters: parking_lot::Mutex::new(VecDeque::new()),
            }),
        })
    }

    /// The strand this wait-group serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Adjust the count by `delta`. A transition to zero wakes every waiter.
    /// Driving the count negative is a usage bug: it clamps to zero and is
    /// logged.
    pub fn add(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut updated = inner.count.load(Ordering::Relaxed) + delta;
            if updated < 0 {
                warn!(
                    excess = -updated,
                    "wait-group count went negative; more done() than add()"
                );
                updated = 0;
            }
            inner.count.store(updated, Ordering::Release);
            if updated == 0 {
                let woken: Vec<Completion> = inner.waiters.lock().drain(..).collect();
                for completion in woken {
                    completion();
                }
            }
        });
    }

    /// Mark one tracked task finished; equivalent to `add(-1)`.
    pub fn done(&self) {
        self.add(-1);
    }

    /// Wait for the count to reach zero; completes immediately if it already
    /// is.
    pub fn wait_with(&self, completion: impl FnOnce() + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            if inner.count.load(Ordering::Acquire) == 0 {
                completion();
            } else {
                inner.waiters.lock().push_back(Box::new(completion));
            }
        });
    }

    /// Timed wait; the completion receives `false` when `timeout` elapses
    /// before the count reaches zero.
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
            let wake = Box::new(move || {
                if let Some(completion) = race.win() {
                    deadline.cancel();
                    completion(true);
                }
            });
            if inner.count.load(Ordering::Acquire) == 0 {
                wake();
            } else {
                inner.waiters.lock().push_back(wake);
            }
        });
    }

    /// Await the count reaching zero.
    pub async fn wait(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wait_with(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Await the count reaching zero for at most `timeout`; `Ok(false)` on
    /// timeout.
    pub async fn wait_for(&self, timeout: Duration) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.wait_for_with(timeout, move |done| {
            let _ = tx.send(done);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Snapshot of the current count. Readers must tolerate immediate
    /// staleness.
    pub fn count(&self) -> i64 {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Snapshot of the number of queued waiters.
    pub async fn waiting_count(&self) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let waiting = inner.waiters.lock().len();
            let _ = tx.send(waiting);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }
}
