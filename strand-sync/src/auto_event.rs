//! Auto-reset event: a unicast signal with carried-over count.
//!
//! `notify` wakes exactly one waiter, or banks a signal for the next wait
//! when nobody is queued. A signal and a waiter never coexist. The typical
//! use is unicast task dispatch across a pool of workers.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use strand_core::{Completion, Executor, Strand, SyncError, SyncResult};

/// Cloneable handle to an auto-reset event.
#[derive(Clone)]
pub struct AutoResetEvent {
    inner: Arc<Inner>,
}

struct Inner {
    strand: Strand,
    state: parking_lot::Mutex<State>,
}

struct State {
    signals: usize,
    waiters: VecDeque<Completion>,
}

impl AutoResetEvent {
    /// Create an event with its own strand on `executor`.
    pub fn new(executor: &Executor, initially_set: bool) -> Self {
        Self::with_strand(Strand::new(executor), initially_set)
    }

    /// Create an event over an existing strand.
    pub fn with_strand(strand: Strand, initially_set: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                strand,
                state: parking_lot::Mutex::new(State {
                    signals: usize::from(initially_set),
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// The strand this event serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Wait for a signal; consumes one immediately if banked.
    pub fn wait_with(&self, completion: impl FnOnce() + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            if state.signals > 0 {
                state.signals -= 1;
                drop(state);
                completion();
            } else {
                state.waiters.push_back(Box::new(completion));
            }
        });
    }

    /// Wake one waiter, or bank a signal if nobody is waiting.
    pub fn notify(&self) {
        self.notify_n(1);
    }

    /// Apply `notify` `n` times in one strand task: the first waiters in
    /// FIFO order are woken, the residue is banked.
    pub fn notify_n(&self, n: usize) {
        if n == 0 {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            let mut woken = Vec::new();
            for _ in 0..n {
                match state.waiters.pop_front() {
                    Some(completion) => woken.push(completion),
                    None => state.signals += 1,
                }
            }
            drop(state);
            for completion in woken {
                completion();
            }
        });
    }

    /// Consume one signal if banked; never queues.
    pub fn try_wait_with(&self, completion: impl FnOnce(bool) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            let granted = state.signals > 0;
            if granted {
                state.signals -= 1;
            }
            drop(state);
            completion(granted);
        });
    }

    /// Discard every banked signal. Queued waiters are unaffected.
    pub fn reset(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            inner.state.lock().signals = 0;
        });
    }

    /// Wake every queued waiter at once, without consuming signals.
    pub fn cancel_all(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut state = inner.state.lock();
            let woken: Vec<Completion> = state.waiters.drain(..).collect();
            drop(state);
            for completion in woken {
                completion();
            }
        });
    }

    /// Await one signal.
    pub async fn wait(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wait_with(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Consume one signal if banked, without waiting.
    pub async fn try_wait(&self) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.try_wait_with(move |granted| {
            let _ = tx.send(granted);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Snapshot of the banked signal count.
    pub async fn signal_count(&self) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let signals = inner.state.lock().signals;
            let _ = tx.send(signals);
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

    fn auto_event() -> AutoResetEvent {
        AutoResetEvent::new(&Executor::current(), false)
    }

    #[tokio::test]
    async fn notify_wakes_exactly_one() {
        let event = auto_event();
        let woken = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let woken = Arc::clone(&woken);
            event.wait_with(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        event.notify();
        assert_eq!(event.waiting_count().await.unwrap(), 2);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(event.signal_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn notify_without_waiter_banks_a_signal() {
        let event = auto_event();
        event.notify();
        assert_eq!(event.signal_count().await.unwrap(), 1);
        event.wait().await.unwrap();
        assert_eq!(event.signal_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn initially_set_carries_one_signal() {
        let event = AutoResetEvent::new(&Executor::current(), true);
        assert_eq!(event.signal_count().await.unwrap(), 1);
        event.wait().await.unwrap();
    }

    #[tokio::test]
    async fn notify_n_wakes_waiters_then_banks_residue() {
        let event = auto_event();
        let woken = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let woken = Arc::clone(&woken);
            event.wait_with(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        event.notify_n(5);
        assert_eq!(woken.load(Ordering::SeqCst), 2);
        assert_eq!(event.signal_count().await.unwrap(), 3);
        assert_eq!(event.waiting_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn try_wait_never_queues() {
        let event = auto_event();
        assert!(!event.try_wait().await.unwrap());
        event.notify();
        assert!(event.try_wait().await.unwrap());
        assert_eq!(event.waiting_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_clears_signals_but_not_waiters() {
        let event = auto_event();
        event.notify_n(3);
        event.reset();
        assert_eq!(event.signal_count().await.unwrap(), 0);

        let woken = Arc::new(AtomicUsize::new(0));
        {
            let woken = Arc::clone(&woken);
            event.wait_with(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        event.reset();
        assert_eq!(event.waiting_count().await.unwrap(), 1);
        assert_eq!(woken.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_all_wakes_everyone() {
        let event = auto_event();
        let woken = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let woken = Arc::clone(&woken);
            event.wait_with(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        event.cancel_all();
        assert_eq!(event.waiting_count().await.unwrap(), 0);
        assert_eq!(woken.load(Ordering::SeqCst), 3);
        assert_eq!(event.signal_count().await.unwrap(), 0);
    }
}
