//! One-shot, re-armable deadline timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::error::{SyncError, SyncResult};
use crate::executor::Executor;
use crate::handler::Completion;

/// One-shot timer over the runtime's sleep.
///
/// `arm` replaces any in-flight arm; `cancel` revokes it. Cancellation is
/// generation-based: a fire that lost the race to a cancel or a re-arm
/// observes a stale generation and returns without invoking its completion.
///
/// This is deliberately best-effort exactly-once: timed waits that need a
/// hard exactly-once guarantee route both finishers through a
/// [`crate::RaceArbiter`] on top of this.
pub struct Deadline {
    inner: Arc<Inner>,
}

struct Inner {
    generation: AtomicU64,
    sleeper: Mutex<Option<AbortHandle>>,
    executor: Executor,
}

impl Deadline {
    pub fn new(executor: &Executor) -> Self {
        Self {
            inner: Arc::new(Inner {
                generation: AtomicU64::new(0),
                sleeper: Mutex::new(None),
                executor: executor.clone(),
            }),
        }
    }

    /// Arm for `delay`. The completion fires once the delay elapses, unless
    /// `cancel` or a re-arm wins first, in which case it is dropped unfired.
    pub fn arm(&self, delay: Duration, completion: Completion) {
        let armed = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(?delay, generation = armed, "deadline armed");
        let inner = Arc::clone(&self.inner);
        let join = self.inner.executor.spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.generation.load(Ordering::Acquire) == armed {
                completion();
            }
        });
        if let Some(previous) = self.inner.sleeper.lock().replace(join.abort_handle()) {
            previous.abort();
        }
    }

    /// Revoke the current arm. The pending completion, if any, is dropped
    /// without being invoked.
    pub fn cancel(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(sleeper) = self.inner.sleeper.lock().take() {
            sleeper.abort();
            trace!("deadline cancelled");
        }
    }

    /// Await a single delay through the armed completion path. Errors with
    /// [`SyncError::Cancelled`] when the arm is revoked before it fires.
    pub async fn wait_for(&self, delay: Duration) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.arm(
            delay,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.await.map_err(|_| SyncError::Cancelled)
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}
