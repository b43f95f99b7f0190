//! Binary exclusion with FIFO handoff.
//!
//! Unlock transfers ownership directly: when waiters are queued, `locked`
//! stays true and the oldest waiter receives the lock, so acquisition order
//! matches registration order. A duplicate unlock is a logged no-op.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

use strand_core::{
    BoolCompletion, Completion, Deadline, Executor, RaceArbiter, Strand, SyncError, SyncResult,
};

/// Cloneable handle to an asynchronous mutex.
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<Inner>,
}

struct Inner {
    strand: Strand,
    state: parking_lot::Mutex<State>,
}

struct State {
    locked: bool,
    waiters: VecDeque<Completion>,
}

/// Scoped lock ownership; dropping it posts the unlock.
pub struct MutexGuard {
    mutex: Mutex,
    held: bool,
}

impl MutexGuard {
    fn new(mutex: Mutex) -> Self {
        Self { mutex, held: true }
    }

    /// Release the lock now instead of at scope end.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.held {
            self.held = false;
            self.mutex.unlock();
        }
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl Mutex {
    /// Create a mutex with its own strand on `executor`.
    pub fn new(executor: &Executor) -> Self {
        Self::with_strand(Strand::new(executor))
    }

    /// Create a mutex over an existing strand.
    pub fn with_strand(strand: Strand) -> Self {
        Self {
            inner: Arc::new(Inner {
                strand,
                state: parking_lot::Mutex::new(State {
                    locked: false,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// The strand this mutex serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Acquire the lock; the completion receives a guard that unlocks on
    /// drop.
    pub fn lock_with(&self, completion: impl FnOnce(MutexGuard) + Send + 'static) {
        let handle = self.clone();
        self.enqueue(Box::new(move || completion(MutexGuard::new(handle))));
    }

    /// Acquire the lock without a guard; the holder must call
    /// [`Mutex::unlock`].
    pub fn lock_raw_with(&self, completion: impl FnOnce() + Send + 'static) {
        self.enqueue(Box::new(completion));
    }

    /// The completion fires once the caller owns the lock.
    fn enqueue(&self, completion: Completion) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if !state.locked {
                state.locked = true;
                drop(state);
                completion();
            } else {
                state.waiters.push_back(completion);
            }
        });
    }

    /// Timed acquire; the completion receives `true` once the lock is held
    /// or `false` after `timeout`. On success the caller owns the lock and
    /// must call [`Mutex::unlock`].
    pub fn try_lock_for_with(
        &self,
        timeout: Duration,
        completion: impl FnOnce(bool) + Send + 'static,
    ) {
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
        let handle = self.clone();
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if !state.locked {
                match race.win() {
                    Some(completion) => {
                        state.locked = true;
                        drop(state);
                        deadline.cancel();
                        completion(true);
                    }
                    // Timed out before the strand task ran; leave the lock
                    // free.
                    None => {}
                }
            } else {
                let grant = Box::new(move || match race.win() {
                    Some(completion) => {
                        deadline.cancel();
                        completion(true);
                    }
                    None => {
                        // Ownership was handed to a wait that already timed
                        // out; pass the lock on.
                        handle.unlock();
                    }
                });
                state.waiters.push_back(grant);
            }
        });
    }

    /// Release the lock, handing it to the oldest waiter if one is queued.
    /// Unlocking an unlocked mutex is a logged no-op.
    pub fn unlock(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if !state.locked {
                drop(state);
                warn!("unlock of an unlocked mutex ignored");
                return;
            }
            match state.waiters.pop_front() {
                Some(next) => {
                    // `locked` stays true: ownership transfers to `next`.
                    drop(state);
                    next();
                }
                None => state.locked = false,
            }
        });
    }

    /// Await the lock; resolves to a guard that unlocks on drop.
    pub async fn lock(&self) -> SyncResult<MutexGuard> {
        let (tx, rx) = oneshot::channel();
        self.lock_with(move |guard| {
            let _ = tx.send(guard);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Await the lock without a guard; pair with [`Mutex::unlock`].
    pub async fn lock_raw(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.lock_raw_with(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Await the lock for at most `timeout`. `Ok(true)` means the lock is
    /// held and must be released with [`Mutex::unlock`].
    pub async fn try_lock_for(&self, timeout: Duration) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.try_lock_for_with(timeout, move |locked| {
            let _ = tx.send(locked);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Snapshot of whether the lock is currently held.
    pub async fn is_locked(&self) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let locked = inner.state.lock().locked;
            let _ = tx.send(locked);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mutex() -> Mutex {
        Mutex::new(&Executor::current())
    }

    #[tokio::test]
    async fn guard_unlocks_on_drop() {
        let mutex = mutex();
        {
            let _guard = mutex.lock().await.unwrap();
            assert!(mutex.is_locked().await.unwrap());
        }
        assert!(!mutex.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn unlock_hands_off_in_fifo_order() {
        let mutex = mutex();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let guard = mutex.lock().await.unwrap();
        for i in 0..3 {
            let log = Arc::clone(&log);
            mutex.lock_with(move |inner_guard| {
                log.lock().push(i);
                drop(inner_guard);
            });
        }
        assert_eq!(mutex.waiting_count().await.unwrap(), 3);
        drop(guard);

        while mutex.waiting_count().await.unwrap() > 0 {
            tokio::task::yield_now().await;
        }
        assert!(!mutex.is_locked().await.unwrap());
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn at_most_one_holder() {
        let mutex = mutex();
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let mutex = mutex.clone();
            let holders = Arc::clone(&holders);
            let max_holders = Arc::clone(&max_holders);
            joins.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let guard = mutex.lock().await.unwrap();
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn double_unlock_is_ignored() {
        let mutex = mutex();
        mutex.lock_raw().await.unwrap();
        mutex.unlock();
        mutex.unlock();
        assert!(!mutex.is_locked().await.unwrap());

        // The mutex still works after the misuse.
        let guard = mutex.lock().await.unwrap();
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn try_lock_for_times_out_while_held() {
        let mutex = mutex();
        let guard = mutex.lock().await.unwrap();
        let locked = mutex.try_lock_for(Duration::from_millis(100)).await.unwrap();
        assert!(!locked);
        drop(guard);
        assert!(!mutex.is_locked().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn try_lock_for_succeeds_when_free() {
        let mutex = mutex();
        let locked = mutex.try_lock_for(Duration::from_millis(100)).await.unwrap();
        assert!(locked);
        assert!(mutex.is_locked().await.unwrap());
        mutex.unlock();
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_passes_the_lock_on() {
        let mutex = mutex();
        let guard = mutex.lock().await.unwrap();

        // This wait times out while queued; when the lock is later released,
        // the dead waiter must hand it to the live one behind it.
        let timed = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.try_lock_for(Duration::from_millis(50)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let live = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.lock().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(timed.await.unwrap(), Ok(false));

        drop(guard);
        let live_guard = live.await.unwrap().unwrap();
        drop(live_guard);
        assert!(!mutex.is_locked().await.unwrap());
    }
}
