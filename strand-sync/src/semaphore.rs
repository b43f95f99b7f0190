//! Counting semaphore with cancellable waiters and batch try-acquire.
//!
//! Each `release` wakes exactly one waiter; a permit and a waiter never
//! coexist. The batch hook [`Semaphore::try_acquire_n_with`] lets a caller
//! that already holds one permit drain additional ones in a single strand
//! task, which is what the queue uses for batch reads.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::trace;

use strand_core::{Executor, IdSource, Strand, SyncError, SyncResult, Waiter, NULL_ID};

/// Cloneable handle to a counting semaphore.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

struct Inner {
    strand: Strand,
    ids: IdSource,
    state: parking_lot::Mutex<State>,
}

struct State {
    count: usize,
    /// FIFO of waiter ids. An entry may be stale after a cancel; grant paths
    /// skip ids that are no longer in `waiters`.
    order: VecDeque<u64>,
    waiters: HashMap<u64, Waiter>,
}

impl State {
    /// Pop the oldest live waiter, skipping ids removed by cancellation.
    fn dequeue(&mut self) -> Option<Waiter> {
        while let Some(id) = self.order.pop_front() {
            if let Some(waiter) = self.waiters.remove(&id) {
                return Some(waiter);
            }
        }
        None
    }
}

impl Semaphore {
    /// Create a semaphore with its own strand on `executor`.
    pub fn new(executor: &Executor, initial: usize) -> Self {
        Self::with_strand(Strand::new(executor), initial)
    }

    /// Create a semaphore over an existing strand.
    ///
    /// Sharing a strand with another primitive serializes their operations
    /// against each other; completions of this semaphore then already run on
    /// that strand.
    pub fn with_strand(strand: Strand, initial: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                strand,
                ids: IdSource::new(),
                state: parking_lot::Mutex::new(State {
                    count: initial,
                    order: VecDeque::new(),
                    waiters: HashMap::new(),
                }),
            }),
        }
    }

    /// The strand this semaphore serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Acquire one permit; `completion` fires once a permit is consumed.
    pub fn acquire_with(&self, completion: impl FnOnce() + Send + 'static) {
        // Waiters registered through the plain path still get an internal id
        // so the id-keyed map can own them; it is just never handed out.
        let id = self.inner.ids.next();
        self.register(id, Box::new(completion));
    }

    /// Acquire one permit, cancellable via the returned id.
    ///
    /// The id is handed out synchronously, before the registering strand
    /// task runs; strand FIFO guarantees the registration is observed before
    /// any cancel the caller issues with it.
    pub fn acquire_cancellable_with(&self, completion: impl FnOnce() + Send + 'static) -> u64 {
        let id = self.inner.ids.next();
        self.register(id, Box::new(completion));
        id
    }

    fn register(&self, id: u64, completion: strand_core::Completion) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if state.count > 0 {
                state.count -= 1;
                drop(state);
                completion();
            } else {
                state.order.push_back(id);
                state.waiters.insert(id, Waiter::new(id, completion));
                trace!(id, "semaphore waiter registered");
            }
        });
    }

    /// Release one permit, waking the oldest waiter if there is one.
    pub fn release(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            match state.dequeue() {
                Some(waiter) => {
                    drop(state);
                    waiter.fire();
                }
                None => state.count += 1,
            }
        });
    }

    /// Release `n` permits in one strand task.
    pub fn release_n(&self, n: usize) {
        if n == 0 {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            let mut woken = Vec::new();
            for _ in 0..n {
                match state.dequeue() {
                    Some(waiter) => woken.push(waiter),
                    None => state.count += 1,
                }
            }
            drop(state);
            for waiter in woken {
                waiter.fire();
            }
        });
    }

    /// Non-blocking acquire; the completion reports whether a permit was
    /// consumed.
    pub fn try_acquire_with(&self, completion: impl FnOnce(bool) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            let granted = state.count > 0;
            if granted {
                state.count -= 1;
            }
            drop(state);
            completion(granted);
        });
    }

    /// Grant up to `max` permits atomically; the completion receives the
    /// granted amount and runs on this semaphore's strand.
    pub fn try_acquire_n_with(&self, max: usize, completion: impl FnOnce(usize) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            let granted = max.min(state.count);
            state.count -= granted;
            drop(state);
            completion(granted);
        });
    }

    /// Cancel the waiter registered under `id`. Its completion is dropped,
    /// never invoked. Idempotent; a no-op for [`NULL_ID`], unknown and
    /// already-granted ids.
    pub fn cancel(&self, id: u64) {
        if id == NULL_ID {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            // The stale entry in `order` is skipped by later grants.
            if inner.state.lock().waiters.remove(&id).is_some() {
                trace!(id, "semaphore waiter cancelled");
            }
        });
    }

    /// Drop every pending waiter without invoking its completion.
    pub fn cancel_all(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            state.waiters.clear();
            state.order.clear();
        });
    }

    /// Await one permit.
    pub async fn acquire(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.acquire_with(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Consume one permit if available, without waiting.
    pub async fn try_acquire(&self) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.try_acquire_with(move |granted| {
            let _ = tx.send(granted);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Consume up to `max` permits without waiting; returns the granted
    /// amount.
    pub async fn try_acquire_n(&self, max: usize) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        self.try_acquire_n_with(max, move |granted| {
            let _ = tx.send(granted);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Snapshot of the current permit count.
    pub async fn count(&self) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let count = inner.state.lock().count;
            let _ = tx.send(count);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Snapshot of the number of pending waiters.
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
    use std::time::Duration;

    fn sem(initial: usize) -> Semaphore {
        Semaphore::new(&Executor::current(), initial)
    }

    #[tokio::test]
    async fn initial_permits_grant_immediately() {
        let sem = sem(2);
        sem.acquire().await.unwrap();
        sem.acquire().await.unwrap();
        assert_eq!(sem.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_wakes_exactly_one_waiter() {
        let sem = sem(0);
        let woken = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let woken = Arc::clone(&woken);
            sem.acquire_with(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(sem.waiting_count().await.unwrap(), 3);

        sem.release();
        assert_eq!(sem.count().await.unwrap(), 0);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(sem.waiting_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn waiters_wake_in_fifo_order() {
        let sem = sem(0);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            sem.acquire_with(move || log.lock().push(i));
        }
        sem.release_n(5);
        assert_eq!(sem.waiting_count().await.unwrap(), 0);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn permit_never_coexists_with_waiter() {
        let sem = sem(0);
        let woken = Arc::new(AtomicUsize::new(0));
        {
            let woken = Arc::clone(&woken);
            sem.acquire_with(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        sem.release();
        // The waiter consumed the release; no count was banked.
        assert_eq!(sem.count().await.unwrap(), 0);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_removes_waiter_without_firing() {
        let sem = sem(0);
        let woken = Arc::new(AtomicUsize::new(0));
        let id = {
            let woken = Arc::clone(&woken);
            sem.acquire_cancellable_with(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            })
        };
        sem.cancel(id);
        assert_eq!(sem.waiting_count().await.unwrap(), 0);

        sem.release();
        assert_eq!(sem.count().await.unwrap(), 1);
        assert_eq!(woken.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_after_grant_is_noop() {
        let sem = sem(1);
        let id = sem.acquire_cancellable_with(|| {});
        assert_eq!(sem.count().await.unwrap(), 0);
        sem.cancel(id);
        sem.cancel(id);
        // Nothing to assert beyond "does not disturb the count".
        assert_eq!(sem.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_break_fifo() {
        let sem = sem(0);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let log0 = Arc::clone(&log);
        let cancel_me = sem.acquire_cancellable_with(move || log0.lock().push("a"));
        let log1 = Arc::clone(&log);
        sem.acquire_with(move || log1.lock().push("b"));
        let log2 = Arc::clone(&log);
        sem.acquire_with(move || log2.lock().push("c"));

        sem.cancel(cancel_me);
        sem.release_n(2);
        assert_eq!(sem.waiting_count().await.unwrap(), 0);
        assert_eq!(*log.lock(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn try_acquire_n_grants_at_most_available() {
        let sem = sem(3);
        assert_eq!(sem.try_acquire_n(5).await.unwrap(), 3);
        assert_eq!(sem.try_acquire_n(5).await.unwrap(), 0);
        assert_eq!(sem.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn try_acquire_reports_availability() {
        let sem = sem(1);
        assert!(sem.try_acquire().await.unwrap());
        assert!(!sem.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn cancel_all_drops_pending_acquires() {
        let sem = sem(0);
        let handle = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire().await })
        };
        // Let the acquire register before cancelling it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        sem.cancel_all();
        assert_eq!(handle.await.unwrap(), Err(SyncError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_releases_and_acquires_balance() {
        let sem = sem(0);
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let completed = Arc::clone(&completed);
            sem.acquire_with(move || {
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }
        let mut joins = Vec::new();
        for _ in 0..5 {
            let sem = sem.clone();
            joins.push(tokio::spawn(async move {
                for _ in 0..10 {
                    sem.release();
                }
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        // Quiesce: waiters equal releases, so everything drains to zero.
        while sem.waiting_count().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(completed.load(Ordering::SeqCst), 50);
        assert_eq!(sem.count().await.unwrap(), 0);
    }
}
