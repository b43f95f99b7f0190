//! Cyclic N-party meeting point.
//!
//! When the last participant arrives, every waiter of the current cycle is
//! released, the arrival count resets and the generation number increments.
//! A participant that leaves for good uses [`Barrier::arrive_and_drop`],
//! which shrinks the party and counts an arrival in the same strand task so
//! no spurious trigger can slip between the two updates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use strand_core::{Completion, Executor, Strand, SyncError, SyncResult};

/// Cloneable handle to a cyclic barrier.
#[derive(Clone)]
pub struct Barrier {
    inner: Arc<Inner>,
}

struct Inner {
    strand: Strand,
    /// Mutated only inside the strand (`arrive_and_drop`); atomic so the
    /// getter can read it anywhere.
    participants: AtomicUsize,
    generation: AtomicU64,
    state: parking_lot::Mutex<State>,
}

struct State {
    arrived: usize,
    waiters: VecDeque<Completion>,
}

impl Barrier {
    /// Create a barrier for `participants` parties with its own strand.
    pub fn new(executor: &Executor, participants: usize) -> SyncResult<Self> {
        Self::with_strand(Strand::new(executor), participants)
    }

    /// Create a barrier over an existing strand.
    pub fn with_strand(strand: Strand, participants: usize) -> SyncResult<Self> {
        if participants == 0 {
            return Err(SyncError::InvalidArgument(
                "barrier needs at least one participant".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                strand,
                participants: AtomicUsize::new(participants),
                generation: AtomicU64::new(0),
                state: parking_lot::Mutex::new(State {
                    arrived: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        })
    }

    /// The strand this barrier serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Arrive and wait for the rest of the party. The finishing arrival
    /// completes first, then the earlier waiters, and the barrier resets for
    /// the next cycle.
    pub fn arrive_and_wait_with(&self, completion: impl FnOnce() + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            state.arrived += 1;
            if state.arrived >= inner.participants.load(Ordering::Relaxed) {
                let woken = Self::open(&inner, &mut state);
                drop(state);
                completion();
                for earlier in woken {
                    earlier();
                }
            } else {
                state.waiters.push_back(Box::new(completion));
            }
        });
    }

    /// Arrive without waiting; pair with [`Barrier::wait_with`] to pick the
    /// cycle up later.
    pub fn arrive(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            state.arrived += 1;
            if state.arrived >= inner.participants.load(Ordering::Relaxed) {
                let woken = Self::open(&inner, &mut state);
                drop(state);
                for completion in woken {
                    completion();
                }
            }
        });
    }

    /// Wait for the current cycle to open without arriving.
    pub fn wait_with(&self, completion: impl FnOnce() + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if state.arrived >= inner.participants.load(Ordering::Relaxed) {
                drop(state);
                completion();
            } else {
                state.waiters.push_back(Box::new(completion));
            }
        });
    }

    /// Arrive and permanently shrink the party by one. Both updates happen
    /// in one strand task; the cycle opens if this arrival completes it.
    pub fn arrive_and_drop(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            let remaining = inner
                .participants
                .load(Ordering::Relaxed)
                .saturating_sub(1)
                .max(1);
            inner.participants.store(remaining, Ordering::Release);
            state.arrived += 1;
            if state.arrived >= remaining {
                let woken = Self::open(&inner, &mut state);
                drop(state);
                for completion in woken {
                    completion();
                }
            }
        });
    }

    /// Drop all waiters and reset the arrival count. Their completions are
    /// never invoked.
    pub fn reset(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            state.arrived = 0;
            state.waiters.clear();
        });
    }

    /// Open the current cycle: must be called with the state lock held.
    fn open(inner: &Arc<Inner>, state: &mut State) -> Vec<Completion> {
        state.arrived = 0;
        inner.generation.fetch_add(1, Ordering::Relaxed);
        state.waiters.drain(..).collect()
    }

    /// Await the rest of the party.
    pub async fn arrive_and_wait(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.arrive_and_wait_with(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Await the current cycle opening, without arriving.
    pub async fn wait(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wait_with(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Current party size. Immediate, possibly-stale read.
    pub fn participants(&self) -> usize {
        self.inner.participants.load(Ordering::Acquire)
    }

    /// Completed cycle count. Immediate, possibly-stale read.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Relaxed)
    }

    /// Snapshot of how many parties have arrived this cycle.
    pub async fn arrived_count(&self) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let arrived = inner.state.lock().arrived;
            let _ = tx.send(arrived);
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
    use std::sync::atomic::AtomicUsize;

    fn barrier(parties: usize) -> Barrier {
        Barrier::new(&Executor::current(), parties).unwrap()
    }

    #[tokio::test]
    async fn zero_participants_is_rejected() {
        let result = Barrier::new(&Executor::current(), 0);
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn last_arrival_opens_the_cycle() {
        let barrier = barrier(3);
        let woken = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let woken = Arc::clone(&woken);
            barrier.arrive_and_wait_with(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(barrier.waiting_count().await.unwrap(), 2);
        assert_eq!(woken.load(Ordering::SeqCst), 0);

        barrier.arrive_and_wait().await.unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 2);
        assert_eq!(barrier.generation(), 1);
        assert_eq!(barrier.arrived_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cycles_repeat_and_generation_counts() {
        let barrier = barrier(2);
        for round in 1..=10u64 {
            let other = {
                let barrier = barrier.clone();
                tokio::spawn(async move { barrier.arrive_and_wait().await })
            };
            barrier.arrive_and_wait().await.unwrap();
            other.await.unwrap().unwrap();
            assert_eq!(barrier.generation(), round);
        }
    }

    #[tokio::test]
    async fn arrive_then_wait_later() {
        let barrier = barrier(2);
        barrier.arrive();
        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };
        tokio::task::yield_now().await;
        barrier.arrive_and_wait().await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn arrive_and_drop_shrinks_the_party() {
        let barrier = barrier(3);
        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.arrive_and_wait().await })
        };
        tokio::task::yield_now().await;

        // One participant leaves: the party is now 2, and with the waiter
        // already arrived plus this drop's arrival the cycle opens.
        barrier.arrive_and_drop();
        waiter.await.unwrap().unwrap();
        assert_eq!(barrier.participants(), 2);
        assert_eq!(barrier.generation(), 1);
    }

    #[tokio::test]
    async fn reset_discards_waiters_silently() {
        let barrier = barrier(3);
        let woken = Arc::new(AtomicUsize::new(0));
        {
            let woken = Arc::clone(&woken);
            barrier.arrive_and_wait_with(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        barrier.reset();
        assert_eq!(barrier.waiting_count().await.unwrap(), 0);
        assert_eq!(barrier.arrived_count().await.unwrap(), 0);
        assert_eq!(woken.load(Ordering::SeqCst), 0);
    }
}
