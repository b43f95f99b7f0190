//! Fan-out broker: one owned queue per subscriber.
//!
//! Publishing copies the item into every live queue; a stopped queue drops
//! its copy. Subscription hands the queue back synchronously but registers
//! it through the strand, so items published before the registration task
//! runs are not delivered to that subscriber. Await
//! [`Dispatcher::subscriber_count`] after subscribing when that matters.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::trace;

use strand_core::{Executor, IdSource, Strand, SyncError, SyncResult};

use crate::queue::Queue;

/// Identifies one subscription of a [`Dispatcher`].
pub type SubscriberId = u64;

/// Cloneable handle to a publish-subscribe dispatcher.
pub struct Dispatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    strand: Strand,
    executor: Executor,
    ids: IdSource,
    subscribers: parking_lot::Mutex<HashMap<SubscriberId, Queue<T>>>,
}

impl<T: Clone + Send + 'static> Dispatcher<T> {
    /// Create a dispatcher on `executor`. Each subscriber queue gets its own
    /// strand on the same executor.
    pub fn new(executor: &Executor) -> Self {
        Self {
            inner: Arc::new(Inner {
                strand: Strand::new(executor),
                executor: executor.clone(),
                ids: IdSource::new(),
                subscribers: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The strand this dispatcher serializes on.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Register a new subscriber and hand its queue back immediately.
    ///
    /// The queue is usable right away, but the registration itself runs
    /// through the strand: a publish that is already queued ahead of it will
    /// not reach this subscriber.
    pub fn subscribe(&self) -> (SubscriberId, Queue<T>) {
        let queue = Queue::new(&self.inner.executor);
        let id = self.inner.ids.next();
        let inner = Arc::clone(&self.inner);
        let registered = queue.clone();
        self.inner.strand.post(move || {
            inner.subscribers.lock().insert(id, registered);
            trace!(id, "subscriber registered");
        });
        (id, queue)
    }

    /// Stop and remove one subscriber's queue. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            if let Some(queue) = inner.subscribers.lock().remove(&id) {
                queue.stop();
                trace!(id, "subscriber removed");
            }
        });
    }

    /// Copy `item` into every live subscriber queue.
    pub fn publish(&self, item: T) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            for queue in inner.subscribers.lock().values() {
                queue.push(item.clone());
            }
        });
    }

    /// Copy a batch into every live subscriber queue.
    pub fn publish_batch(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            for queue in inner.subscribers.lock().values() {
                queue.push_batch(items.clone());
            }
        });
    }

    /// Stop every subscriber queue and drop all registrations.
    pub fn clear(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let mut subscribers = inner.subscribers.lock();
            for (_, queue) in subscribers.drain() {
                queue.stop();
            }
        });
    }

    /// Snapshot of the number of registered subscribers. Completes after
    /// every earlier subscription task, so it doubles as the fence for the
    /// subscribe/publish race.
    pub async fn subscriber_count(&self) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.strand.post(move || {
            let count = inner.subscribers.lock().len();
            let _ = tx.send(count);
        });
        rx.await.map_err(|_| SyncError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher<u32> {
        Dispatcher::new(&Executor::current())
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_item_in_order() {
        let dispatcher = dispatcher();
        let (_, first) = dispatcher.subscribe();
        let (_, second) = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count().await.unwrap(), 2);

        for i in 1..=5 {
            dispatcher.publish(i);
        }
        for queue in [first, second] {
            for i in 1..=5 {
                assert_eq!(queue.read().await.unwrap(), i);
            }
        }
    }

    #[tokio::test]
    async fn publish_batch_fans_out() {
        let dispatcher = dispatcher();
        let (_, queue) = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count().await.unwrap(), 1);

        dispatcher.publish_batch(vec![1, 2, 3]);
        assert_eq!(queue.read_batch(10).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_the_queue() {
        let dispatcher = dispatcher();
        let (id, queue) = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count().await.unwrap(), 1);

        dispatcher.unsubscribe(id);
        assert_eq!(dispatcher.subscriber_count().await.unwrap(), 0);
        assert_eq!(queue.read().await, Err(SyncError::Cancelled));

        // Publishes after removal don't reach the stopped queue.
        dispatcher.publish(1);
        assert_eq!(dispatcher.subscriber_count().await.unwrap(), 0);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_stops_everyone() {
        let dispatcher = dispatcher();
        let (_, first) = dispatcher.subscribe();
        let (_, second) = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count().await.unwrap(), 2);

        dispatcher.clear();
        assert_eq!(dispatcher.subscriber_count().await.unwrap(), 0);
        assert_eq!(first.read().await, Err(SyncError::Cancelled));
        assert_eq!(second.read().await, Err(SyncError::Cancelled));
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_publishes() {
        let dispatcher = dispatcher();
        let (_, early) = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count().await.unwrap(), 1);

        dispatcher.publish(1);
        let (_, late) = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count().await.unwrap(), 2);
        dispatcher.publish(2);

        assert_eq!(early.read().await.unwrap(), 1);
        assert_eq!(early.read().await.unwrap(), 2);
        assert_eq!(late.read().await.unwrap(), 2);
        assert_eq!(late.len().await.unwrap(), 0);
    }
}
