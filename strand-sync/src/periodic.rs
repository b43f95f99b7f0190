//! Periodic wake source with pause/resume and retuning.
//!
//! Each `tick` arms the internal deadline for one period. While the timer is
//! stopped or paused the completion of a `tick_with` call is dropped, never
//! invoked; the async [`PeriodicTimer::tick`] therefore resolves to
//! `Err(Cancelled)` in that state, which is the supported way to observe it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use strand_core::{Deadline, Executor, Strand, SyncError, SyncResult};

/// Cloneable handle to a periodic timer.
#[derive(Clone)]
pub struct PeriodicTimer {
    inner: Arc<Inner>,
}

struct Inner {
    strand: Strand,
    deadline: Deadline,
    period: parking_lot::Mutex<Duration>,
    running: AtomicBool,
    paused: AtomicBool,
}

impl PeriodicTimer {
    /// Create a timer with its own strand on `executor`. `period` must be
    /// non-zero.
    pub fn new(executor: &Executor, period: Duration) -> SyncResult<Self> {
        Self::with_strand(Strand::new(executor), period)
    }

    /// Create a timer over an existing strand.
    pub fn with_strand(strand: Strand, period: Duration) -> SyncResult<Self> {
        if period.is_zero() {
            return Err(SyncError::InvalidArgument(
                "timer period must be non-zero".into(),
            ));
        }
        let deadline = Deadline::new(strand.executor());
        Ok(Self {
            inner: Arc::new(Inner {
                strand,
                deadline,
                period: parking_lot::Mutex::new(period),
                running: AtomicBool::new(true),
                paused: AtomicBool::new(false),
            }),
        })
    }

    /// The strand this timer serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Arm for one period; the completion fires when it elapses. If the
    /// timer is stopped or paused the completion is dropped silently.
    pub fn tick_with(&self, completion: impl FnOnce() + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            if !inner.running.load(Ordering::Acquire) || inner.paused.load(Ordering::Acquire) {
                return;
            }
            let period = *inner.period.lock();
            let gate = Arc::clone(&inner);
            inner.deadline.arm(
                period,
                Box::new(move || {
                    if gate.running.load(Ordering::Acquire) && !gate.paused.load(Ordering::Acquire)
                    {
                        completion();
                    }
                }),
            );
        });
    }

    /// Await the next period. Resolves to `Err(Cancelled)` if the timer is
    /// (or becomes) stopped or paused before the period elapses.
    pub async fn tick(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tick_with(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Stop the timer and cancel any in-flight arm.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            inner.deadline.cancel();
        });
    }

    /// Pause the timer; an in-flight arm is cancelled.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            inner.deadline.cancel();
        });
    }

    /// Undo a pause; takes effect from the next `tick`.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
    }

    /// Clear both the stopped and paused flags.
    pub fn restart(&self) {
        self.inner.running.store(true, Ordering::Release);
        self.inner.paused.store(false, Ordering::Release);
    }

    /// Change the period; applies from the next `tick`.
    pub fn set_period(&self, period: Duration) {
        if period.is_zero() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            *inner.period.lock() = period;
        });
    }

    /// The current period.
    pub fn period(&self) -> Duration {
        *self.inner.period.lock()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }
}
