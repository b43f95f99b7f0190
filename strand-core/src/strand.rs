//! Cooperative serializer.
//!
//! A [`Strand`] guarantees that its posted tasks run one at a time, in FIFO
//! order, but not necessarily on the same OS thread. Primitives route every
//! mutation of their state through a strand, which removes the need for any
//! kernel lock in steady state.
//!
//! Cloning a `Strand` shares the underlying task queue; several primitives
//! constructed over the same strand therefore serialize against each other,
//! which the queue exploits to let its embedded semaphore's completions touch
//! the item buffer without another hop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::executor::Executor;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle to a serializer. All clones share one task queue.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<VecDeque<Task>>,
    /// True while a drain task is live on the executor.
    draining: AtomicBool,
    executor: Executor,
}

impl Strand {
    /// Create a fresh serializer on `executor`.
    pub fn new(executor: &Executor) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                executor: executor.clone(),
            }),
        }
    }

    /// The executor this strand drains on.
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// Whether `other` is a handle to the same serializer.
    pub fn same_strand(&self, other: &Strand) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Enqueue a task. Returns immediately; the task runs after every task
    /// posted before it, and never concurrently with another task of this
    /// strand.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.queue.lock().push_back(Box::new(task));
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            // A drain task is live; it holds the queue until empty and will
            // observe the entry we just pushed.
            return;
        }
        trace!("strand drain spawned");
        let inner = Arc::clone(&self.inner);
        self.inner.executor.spawn(drain(inner));
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand")
            .field("queued", &self.inner.queue.lock().len())
            .field("draining", &self.inner.draining.load(Ordering::Relaxed))
            .finish()
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            match queue.pop_front() {
                Some(task) => task,
                None => {
                    // Still holding the queue lock, so no post can slip in
                    // between the pop and this store: the next post observes
                    // `draining == false` and spawns a fresh drain.
                    inner.draining.store(false, Ordering::Release);
                    trace!("strand drain retired");
                    return;
                }
            }
        };
        task();
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn runs_tasks_in_post_order() {
        let strand = Strand::new(&Executor::current());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();

        for i in 0..100 {
            let log = Arc::clone(&log);
            strand.post(move || log.lock().push(i));
        }
        strand.post(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_runs_two_tasks_at_once() {
        let strand = Strand::new(&Executor::current());
        let live = Arc::new(AtomicUsize::new(0));
        let max_live = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        for _ in 0..500 {
            let live = Arc::clone(&live);
            let max_live = Arc::clone(&max_live);
            strand.post(move || {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                max_live.fetch_max(now, Ordering::SeqCst);
                live.fetch_sub(1, Ordering::SeqCst);
            });
        }
        strand.post(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        assert_eq!(max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn posts_from_many_threads_all_run() {
        let strand = Strand::new(&Executor::current());
        let count = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let strand = strand.clone();
            let count = Arc::clone(&count);
            joins.push(tokio::spawn(async move {
                for _ in 0..250 {
                    let count = Arc::clone(&count);
                    strand.post(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        let (tx, rx) = oneshot::channel();
        strand.post(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 8 * 250);
    }

    #[tokio::test]
    async fn reentrant_post_runs_after_current_task() {
        let strand = Strand::new(&Executor::current());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();

        {
            let strand2 = strand.clone();
            let log = Arc::clone(&log);
            strand.post(move || {
                let inner_log = Arc::clone(&log);
                strand2.post(move || {
                    inner_log.lock().push("inner");
                    let _ = tx.send(());
                });
                log.lock().push("outer");
            });
        }
        rx.await.unwrap();

        assert_eq!(*log.lock(), vec!["outer", "inner"]);
    }
}
