//! One-shot downward counter.
//!
//! The latch triggers exactly once, when its count reaches zero; after that
//! every wait completes immediately and the trigger never un-fires. Counting
//! down past zero is tolerated: the count clamps at zero and an error
//! counter records the overshoot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::warn;

use strand_core::{Completion, Executor, Strand, SyncError, SyncResult};

/// Cloneable handle to a one-shot countdown latch.
#[derive(Clone)]
pub struct Latch {
    inner: Arc<Inner>,
}

struct Inner {
    strand: Strand,
    /// Readable outside the strand; mutated with fetch_sub so `count_down`
    /// never has to hop through the serializer.
    count: AtomicI64,
    triggered: AtomicBool,
    underflows: AtomicU64,
    waiters: parking_lot::Mutex<VecDeque<Completion>>,
}

impl Latch {
    /// Create a latch with its own strand on `executor`.
    ///
    /// `initial` must be non-negative; a zero latch starts triggered.
    pub fn new(executor: &Executor, initial: i64) -> SyncResult<Self> {
        Self::with_strand(Strand::new(executor), initial)
    }

    /// Create a latch over an existing strand.
    pub fn with_strand(strand: Strand, initial: i64) -> SyncResult<Self> {
        if initial < 0 {
            return Err(SyncError::InvalidArgument(
                "latch count must be non-negative".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                strand,
                count: AtomicI64::new(initial),
                triggered: AtomicBool::new(initial == 0),
                underflows: AtomicU64::new(0),
                waiters: parking_lot::Mutex::new(VecDeque::new()),
            }),
        })
    }

    /// The strand this latch serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Decrement the count by `n`; the transition to zero triggers the latch
    /// and wakes every waiter. Overshoot clamps to zero and is recorded in
    /// [`Latch::underflow_count`].
    pub fn count_down(&self, n: i64) {
        if n <= 0 {
            return;
        }
        let previous = self.inner.count.fetch_sub(n, Ordering::AcqRel);
        let mut updated = previous - n;
        if updated < 0 {
            self.inner.count.store(0, Ordering::Release);
            self.inner.underflows.fetch_add(1, Ordering::Relaxed);
            warn!(overshoot = -updated, "latch counted down past zero");
            updated = 0;
        }
        if updated == 0 && !self.inner.triggered.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(&self.inner);
            self.inner.strand.post(move || {
                let woken: Vec<Completion> = inner.waiters.lock().drain(..).collect();
                for completion in woken {
                    completion();
                }
            });
        }
    }

    /// Fused decrement-and-wait. If the caller's decrement causes the
    /// trigger, earlier waiters wake first and the caller completes in the
    /// same strand task.
    pub fn arrive_and_wait_with(&self, n: i64, completion: impl FnOnce() + Send + 'static) {
        if n > 0 {
            let previous = self.inner.count.fetch_sub(n, Ordering::AcqRel);
            let mut updated = previous - n;
            if updated < 0 {
                self.inner.count.store(0, Ordering::Release);
                self.inner.underflows.fetch_add(1, Ordering::Relaxed);
                warn!(overshoot = -updated, "latch counted down past zero");
                updated = 0;
            }
            if updated == 0 && !self.inner.triggered.swap(true, Ordering::AcqRel) {
                let inner = Arc::clone(&self.inner);
                self.inner.strand.post(move || {
                    let woken: Vec<Completion> = inner.waiters.lock().drain(..).collect();
                    for earlier in woken {
                        earlier();
                    }
                    completion();
                });
                return;
            }
        }
        self.register(Box::new(completion));
    }

    /// Wait for the trigger; completes immediately if already triggered.
    pub fn wait_with(&self, completion: impl FnOnce() + Send + 'static) {
        self.register(Box::new(completion));
    }

    fn register(&self, completion: Completion) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            if inner.triggered.load(Ordering::Acquire) {
                completion();
            } else {
                inner.waiters.lock().push_back(completion);
            }
        });
    }

    /// Await the trigger.
    pub async fn wait(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wait_with(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Decrement by `n` and await the trigger.
    pub async fn arrive_and_wait(&self, n: i64) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.arrive_and_wait_with(n, move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Whether the latch has triggered; an immediate, possibly-stale read.
    pub fn try_wait(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Snapshot of the remaining count, clamped at zero.
    pub fn count(&self) -> i64 {
        self.inner.count.load(Ordering::Acquire).max(0)
    }

    /// How many `count_down` calls overshot zero.
    pub fn underflow_count(&self) -> u64 {
        self.inner.underflows.load(Ordering::Relaxed)
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
