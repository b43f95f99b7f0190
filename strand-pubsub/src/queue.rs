//! Unbounded FIFO queue built from a semaphore and a deque.
//!
//! Invariant: every `push` issues exactly one semaphore release and every
//! granted permit corresponds to exactly one dequeued item, so the permit
//! count equals the item count whenever no reader is mid-drain. `stop`
//! cancels all current and future readers but deliberately leaves residual
//! items in place; clearing them would desynchronize permits from items.
//! Residue is freed when the queue drops.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{error, trace};

use strand_core::{Deadline, Executor, RaceArbiter, Strand, SyncError, SyncResult, NULL_ID};
use strand_sync::Semaphore;

type ReadCompletion<T> = Box<dyn FnOnce(SyncResult<T>) + Send + 'static>;
type BatchCompletion<T> = Box<dyn FnOnce(SyncResult<Vec<T>>) + Send + 'static>;

/// Cloneable handle to an async FIFO queue.
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    strand: Strand,
    /// Shares `strand`, so its completions run where `state` may be touched.
    semaphore: Semaphore,
    state: parking_lot::Mutex<State<T>>,
}

struct State<T> {
    items: VecDeque<T>,
    stopped: bool,
}

impl<T: Send + 'static> Queue<T> {
    /// Create a queue with its own strand on `executor`.
    pub fn new(executor: &Executor) -> Self {
        Self::with_strand(Strand::new(executor))
    }

    /// Create a queue over an existing strand.
    pub fn with_strand(strand: Strand) -> Self {
        let semaphore = Semaphore::with_strand(strand.clone(), 0);
        Self {
            inner: Arc::new(Inner {
                strand,
                semaphore,
                state: parking_lot::Mutex::new(State {
                    items: VecDeque::new(),
                    stopped: false,
                }),
            }),
        }
    }

    /// The strand this queue serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Append one item and wake one reader. Silently dropped when stopped.
    pub fn push(&self, item: T) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if state.stopped {
                trace!("push on stopped queue dropped");
                return;
            }
            state.items.push_back(item);
            drop(state);
            inner.semaphore.release();
        });
    }

    /// Append a batch and wake up to `items.len()` readers.
    pub fn push_batch(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if state.stopped {
                trace!(count = items.len(), "batch push on stopped queue dropped");
                return;
            }
            let count = items.len();
            state.items.extend(items);
            drop(state);
            inner.semaphore.release_n(count);
        });
    }

    /// Read one item; the completion receives `Err(Cancelled)` if the queue
    /// is already stopped or stops before an item arrives.
    pub fn read_with(&self, completion: impl FnOnce(SyncResult<T>) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            if inner.state.lock().stopped {
                completion(Err(SyncError::Cancelled));
                return;
            }
            let grant = Arc::clone(&inner);
            inner.semaphore.acquire_with(move || {
                // Runs on the shared strand.
                completion(Self::pop_one(&grant));
            });
        });
    }

    /// Read between 1 and `max` items: wait for the first, then drain what
    /// is immediately available without further waiting.
    pub fn read_batch_with(
        &self,
        max: usize,
        completion: impl FnOnce(SyncResult<Vec<T>>) + Send + 'static,
    ) {
        let max = max.max(1);
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            if inner.state.lock().stopped {
                completion(Err(SyncError::Cancelled));
                return;
            }
            let grant = Arc::clone(&inner);
            inner.semaphore.acquire_with(move || {
                let batch = Arc::clone(&grant);
                grant.semaphore.try_acquire_n_with(max - 1, move |extra| {
                    let outcome = Self::pop_many(&batch, 1 + extra);
                    completion(outcome);
                });
            });
        });
    }

    /// Read one item, giving up after `timeout`. On timeout no item is
    /// consumed and the completion receives `Err(TimedOut)`.
    pub fn read_timeout_with(
        &self,
        timeout: Duration,
        completion: impl FnOnce(SyncResult<T>) + Send + 'static,
    ) {
        let race: Arc<RaceArbiter<ReadCompletion<T>>> = RaceArbiter::new(Box::new(completion));
        let deadline = Arc::new(Deadline::new(self.inner.strand.executor()));
        // Filled in once the waiter registers; the timer tolerates reading
        // it before then (cancelling the null id is a no-op).
        let waiter_id = Arc::new(AtomicU64::new(NULL_ID));

        let inner = Arc::clone(&self.inner);
        let init_race = Arc::clone(&race);
        let init_deadline = Arc::clone(&deadline);
        let init_id = Arc::clone(&waiter_id);
        self.inner.strand.post(move || {
            if inner.state.lock().stopped {
                if let Some(completion) = init_race.win() {
                    init_deadline.cancel();
                    completion(Err(SyncError::Cancelled));
                }
                return;
            }
            if init_race.is_decided() {
                return;
            }
            let grant = Arc::clone(&inner);
            let grant_race = Arc::clone(&init_race);
            let grant_deadline = Arc::clone(&init_deadline);
            let id = inner.semaphore.acquire_cancellable_with(move || {
                match grant_race.win() {
                    Some(completion) => {
                        grant_deadline.cancel();
                        completion(Self::pop_one(&grant));
                    }
                    None => {
                        // The timeout won just as the grant arrived: hand
                        // the permit back so its item stays claimable.
                        grant.semaphore.release();
                    }
                }
            });
            init_id.store(id, Ordering::Release);
        });

        let semaphore = self.inner.semaphore.clone();
        deadline.arm(
            timeout,
            Box::new(move || {
                if let Some(completion) = race.win() {
                    semaphore.cancel(waiter_id.load(Ordering::Acquire));
                    completion(Err(SyncError::TimedOut));
                }
            }),
        );
    }

    /// Batch read with a timeout on the first item. On timeout nothing is
    /// consumed.
    pub fn read_batch_timeout_with(
        &self,
        max: usize,
        timeout: Duration,
        completion: impl FnOnce(SyncResult<Vec<T>>) + Send + 'static,
    ) {
        let max = max.max(1);
        let race: Arc<RaceArbiter<BatchCompletion<T>>> = RaceArbiter::new(Box::new(completion));
        let deadline = Arc::new(Deadline::new(self.inner.strand.executor()));
        let waiter_id = Arc::new(AtomicU64::new(NULL_ID));

        let inner = Arc::clone(&self.inner);
        let init_race = Arc::clone(&race);
        let init_deadline = Arc::clone(&deadline);
        let init_id = Arc::clone(&waiter_id);
        self.inner.strand.post(move || {
            if inner.state.lock().stopped {
                if let Some(completion) = init_race.win() {
                    init_deadline.cancel();
                    completion(Err(SyncError::Cancelled));
                }
                return;
            }
            if init_race.is_decided() {
                return;
            }
            let grant = Arc::clone(&inner);
            let grant_race = Arc::clone(&init_race);
            let grant_deadline = Arc::clone(&init_deadline);
            let id = inner.semaphore.acquire_cancellable_with(move || {
                match grant_race.win() {
                    Some(completion) => {
                        grant_deadline.cancel();
                        let batch = Arc::clone(&grant);
                        grant.semaphore.try_acquire_n_with(max - 1, move |extra| {
                            let outcome = Self::pop_many(&batch, 1 + extra);
                            completion(outcome);
                        });
                    }
                    None => {
                        grant.semaphore.release();
                    }
                }
            });
            init_id.store(id, Ordering::Release);
        });

        let semaphore = self.inner.semaphore.clone();
        deadline.arm(
            timeout,
            Box::new(move || {
                if let Some(completion) = race.win() {
                    semaphore.cancel(waiter_id.load(Ordering::Acquire));
                    completion(Err(SyncError::TimedOut));
                }
            }),
        );
    }

    /// Pop one item for a granted permit. Runs on the shared strand.
    fn pop_one(inner: &Inner<T>) -> SyncResult<T> {
        let mut state = inner.state.lock();
        if state.stopped {
            return Err(SyncError::Cancelled);
        }
        match state.items.pop_front() {
            Some(item) => Ok(item),
            // Defensive: a granted permit without an item can only follow a
            // stop that raced the grant.
            None => Err(SyncError::Cancelled),
        }
    }

    /// Pop `count` items for `count` granted permits. Runs on the shared
    /// strand.
    fn pop_many(inner: &Inner<T>, count: usize) -> SyncResult<Vec<T>> {
        let mut state = inner.state.lock();
        if state.stopped {
            return Err(SyncError::Cancelled);
        }
        if state.items.len() < count {
            let available = state.items.len();
            drop(state);
            error!(
                granted = count,
                available, "queue item count diverged from granted permits"
            );
            panic!("queue invariant violated: {count} permits granted but only {available} items");
        }
        Ok(state.items.drain(..count).collect())
    }

    /// Stop the queue: future pushes are dropped and every current and
    /// future reader completes with `Err(Cancelled)`. Residual items remain
    /// until the queue drops.
    pub fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            inner.state.lock().stopped = true;
            inner.semaphore.cancel_all();
        });
    }

    /// Await one item.
    pub async fn read(&self) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.read_with(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// Await between 1 and `max` items.
    pub async fn read_batch(&self, max: usize) -> SyncResult<Vec<T>> {
        let (tx, rx) = oneshot::channel();
        self.read_batch_with(max, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// Await one item for at most `timeout`.
    pub async fn read_timeout(&self, timeout: Duration) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.read_timeout_with(timeout, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// Await a batch for at most `timeout`.
    pub async fn read_batch_timeout(&self, max: usize, timeout: Duration) -> SyncResult<Vec<T>> {
        let (tx, rx) = oneshot::channel();
        self.read_batch_timeout_with(max, timeout, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// Snapshot of the buffered item count.
    pub async fn len(&self) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let len = inner.state.lock().items.len();
            let _ = tx.send(len);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Snapshot of whether the queue has been stopped.
    pub async fn is_stopped(&self) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let stopped = inner.state.lock().stopped;
            let _ = tx.send(stopped);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Adapt reads into a stream that ends when the queue is stopped.
    pub fn into_stream(self) -> impl futures::Stream<Item = T> {
        futures::stream::unfold(self, |queue| async move {
            match queue.read().await {
                Ok(item) => Some((item, queue)),
                Err(_) => None,
            }
        })
    }
}
