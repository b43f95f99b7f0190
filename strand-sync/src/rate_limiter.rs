//! Token-bucket rate limiter with burst capacity and variable-cost requests.
//!
//! Tokens replenish lazily at `rate` per `period`, capped at `capacity`.
//! Requests that cannot be satisfied queue FIFO; a single internal deadline
//! is armed for the instant the head waiter's cost becomes affordable and
//! grants as many head waiters as fit each time it fires.
//!
//! `stop()` completes every queued waiter with a distinct cancelled outcome
//! rather than a grant, so callers can tell the two apart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use strand_core::{Deadline, Executor, Strand, SyncError, SyncResult};

type AcquireCompletion = Box<dyn FnOnce(SyncResult<()>) + Send + 'static>;

/// Cloneable handle to a token-bucket rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    strand: Strand,
    deadline: Deadline,
    /// Tokens added per `period`. Mutated only inside the strand; atomic so
    /// the getter can read it anywhere.
    rate: AtomicU64,
    period: Duration,
    capacity: u64,
    state: parking_lot::Mutex<State>,
}

struct State {
    tokens: f64,
    last_refill: Instant,
    waiters: VecDeque<CostWaiter>,
    running: bool,
}

struct CostWaiter {
    cost: u64,
    completion: AcquireCompletion,
}

impl RateLimiter {
    /// Create a limiter with its own strand on `executor`.
    ///
    /// `rate` tokens replenish per `period`; the bucket holds at most
    /// `capacity` tokens and starts full. `capacity == 0` means
    /// "capacity = rate" (no burst headroom beyond one period).
    pub fn new(
        executor: &Executor,
        rate: u64,
        period: Duration,
        capacity: u64,
    ) -> SyncResult<Self> {
        Self::with_strand(Strand::new(executor), rate, period, capacity)
    }

    /// Create a limiter over an existing strand.
    pub fn with_strand(
        strand: Strand,
        rate: u64,
        period: Duration,
        capacity: u64,
    ) -> SyncResult<Self> {
        if rate == 0 {
            return Err(SyncError::InvalidArgument("rate must be non-zero".into()));
        }
        if period.is_zero() {
            return Err(SyncError::InvalidArgument("period must be non-zero".into()));
        }
        let capacity = if capacity == 0 { rate } else { capacity };
        if capacity < rate {
            return Err(SyncError::InvalidArgument(
                "capacity must be at least the rate".into(),
            ));
        }
        let deadline = Deadline::new(strand.executor());
        Ok(Self {
            inner: Arc::new(Inner {
                strand,
                deadline,
                rate: AtomicU64::new(rate),
                period,
                capacity,
                state: parking_lot::Mutex::new(State {
                    tokens: capacity as f64,
                    last_refill: Instant::now(),
                    waiters: VecDeque::new(),
                    running: true,
                }),
            }),
        })
    }

    /// The strand this limiter serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Acquire `cost` tokens. The completion receives `Ok` once the tokens
    /// are deducted, `Err(Cancelled)` if the limiter is stopped first, and
    /// `Err(InvalidArgument)` for a cost the bucket can never hold.
    pub fn acquire_with(
        &self,
        cost: u64,
        completion: impl FnOnce(SyncResult<()>) + Send + 'static,
    ) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if !state.running {
                drop(state);
                completion(Err(SyncError::Cancelled));
                return;
            }
            if cost > inner.capacity {
                drop(state);
                completion(Err(SyncError::InvalidArgument(
                    "cost exceeds bucket capacity".into(),
                )));
                return;
            }
            refill(&inner, &mut state);
            if state.tokens >= cost as f64 {
                state.tokens -= cost as f64;
                drop(state);
                completion(Ok(()));
            } else {
                state.waiters.push_back(CostWaiter {
                    cost,
                    completion: Box::new(completion),
                });
                let granted = replenish_and_schedule(&inner, &mut state);
                drop(state);
                for waiter in granted {
                    (waiter.completion)(Ok(()));
                }
            }
        });
    }

    /// Take `cost` tokens if currently available; never queues.
    pub fn try_acquire_with(&self, cost: u64, completion: impl FnOnce(bool) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if !state.running {
                drop(state);
                completion(false);
                return;
            }
            refill(&inner, &mut state);
            let granted = state.tokens >= cost as f64;
            if granted {
                state.tokens -= cost as f64;
            }
            drop(state);
            completion(granted);
        });
    }

    /// Stop the limiter: the refill deadline is cancelled and every queued
    /// waiter completes with `Err(Cancelled)`.
    pub fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            state.running = false;
            inner.deadline.cancel();
            let cancelled: Vec<CostWaiter> = state.waiters.drain(..).collect();
            drop(state);
            for waiter in cancelled {
                (waiter.completion)(Err(SyncError::Cancelled));
            }
        });
    }

    /// Refill the bucket to capacity, restart if stopped, and grant as many
    /// queued waiters as now fit.
    pub fn reset(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            state.tokens = inner.capacity as f64;
            state.last_refill = Instant::now();
            state.running = true;
            let granted = replenish_and_schedule(&inner, &mut state);
            drop(state);
            for waiter in granted {
                (waiter.completion)(Ok(()));
            }
        });
    }

    /// Change the refill rate; accrual up to now is settled at the old rate
    /// and the pending refill deadline is recomputed.
    pub fn set_rate(&self, rate: u64) {
        if rate == 0 {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            refill(&inner, &mut state);
            inner.rate.store(rate, Ordering::Release);
            let granted = replenish_and_schedule(&inner, &mut state);
            drop(state);
            for waiter in granted {
                (waiter.completion)(Ok(()));
            }
        });
    }

    /// Await `cost` tokens.
    pub async fn acquire(&self, cost: u64) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.acquire_with(cost, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// Take `cost` tokens if currently available.
    pub async fn try_acquire(&self, cost: u64) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.try_acquire_with(cost, move |granted| {
            let _ = tx.send(granted);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Snapshot of the whole tokens currently available (after a refill).
    pub async fn available_tokens(&self) -> SyncResult<u64> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            refill(&inner, &mut state);
            let available = state.tokens as u64;
            drop(state);
            let _ = tx.send(available);
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

    /// Tokens replenished per period. Immediate, possibly-stale read.
    pub fn rate(&self) -> u64 {
        self.inner.rate.load(Ordering::Acquire)
    }

    /// Maximum tokens the bucket holds.
    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }
}

/// Settle lazily-accrued tokens. Must be called with the state lock held.
fn refill(inner: &Inner, state: &mut State) {
    let now = Instant::now();
    let elapsed = now.saturating_duration_since(state.last_refill);
    if elapsed.is_zero() {
        return;
    }
    let rate = inner.rate.load(Ordering::Relaxed) as f64;
    let accrued = elapsed.as_secs_f64() / inner.period.as_secs_f64() * rate;
    state.tokens = (state.tokens + accrued).min(inner.capacity as f64);
    state.last_refill = now;
}

/// Refill, pop every head waiter that now fits, and arm the deadline for the
/// moment the next head becomes affordable. Must be called with the state
/// lock held; the returned waiters are granted and must be completed by the
/// caller after releasing the lock.
fn replenish_and_schedule(inner: &Arc<Inner>, state: &mut State) -> Vec<CostWaiter> {
    refill(inner, state);

    let mut granted = Vec::new();
    loop {
        match state.waiters.front() {
            Some(head) if state.tokens >= head.cost as f64 => {}
            _ => break,
        }
        if let Some(waiter) = state.waiters.pop_front() {
            state.tokens -= waiter.cost as f64;
            granted.push(waiter);
        }
    }

    if let Some(head) = state.waiters.front() {
        let deficit = head.cost as f64 - state.tokens;
        let rate = inner.rate.load(Ordering::Relaxed) as f64;
        let delay = inner.period.mul_f64(deficit / rate);
        trace!(?delay, deficit, "rate limiter refill scheduled");
        let wake = Arc::clone(inner);
        inner.deadline.arm(
            delay,
            Box::new(move || {
                let inner = Arc::clone(&wake);
                wake.strand.post(move || {
                    let mut state = inner.state.lock();
                    if !state.running {
                        return;
                    }
                    let granted = replenish_and_schedule(&inner, &mut state);
                    drop(state);
                    for waiter in granted {
                        (waiter.completion)(Ok(()));
                    }
                });
            }),
        );
    }
    granted
}
