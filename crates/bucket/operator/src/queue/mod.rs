mod rate_limiter;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    hash::Hash,
    pin::pin,
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{Mutex, Notify},
    time::sleep,
};
use tracing::debug;

pub use self::rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    RateLimiterConfig,
};

/// An item whose identity, not its payload, is used for de-duplication.
pub trait Keyed {
    type Key: Clone + fmt::Display + Eq + Hash + Send + Sync;

    fn key(&self) -> &Self::Key;

    /// Folds `other`, an item of the same key, into this pending one.
    ///
    /// `newer` is false when `other` is a delayed re-add that predates this
    /// item. The newer item replaces the older one by default.
    fn merge(&mut self, other: Self, newer: bool)
    where
        Self: Sized,
    {
        if newer {
            *self = other;
        }
    }
}

/// A de-duplicating, rate-limited queue of reconciliation requests.
///
/// A key is handed to at most one [`WorkQueue::get`] caller until that caller
/// calls [`WorkQueue::done`]; items added for a key in the meantime are
/// collapsed and delivered once afterwards.
pub struct WorkQueue<T>
where
    T: Keyed,
{
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T::Key>>,
    state: Mutex<QueueState<T>>,
}

struct QueueState<T>
where
    T: Keyed,
{
    /// Keys ready to be handed out, in FIFO order.
    queue: VecDeque<T::Key>,
    /// The pending item of every key that needs processing.
    dirty: HashMap<T::Key, T>,
    processing: HashSet<T::Key>,
    shutting_down: bool,
}

impl<T> Default for QueueState<T>
where
    T: Keyed,
{
    fn default() -> Self {
        Self {
            queue: VecDeque::default(),
            dirty: HashMap::default(),
            processing: HashSet::default(),
            shutting_down: false,
        }
    }
}

impl<T> WorkQueue<T>
where
    T: 'static + Keyed + Send,
    <T as Keyed>::Key: 'static,
{
    pub fn new<R>(rate_limiter: R) -> Self
    where
        R: 'static + RateLimiter<T::Key>,
    {
        Self {
            notify: Notify::default(),
            rate_limiter: Box::new(rate_limiter),
            state: Mutex::default(),
        }
    }

    pub fn with_default_rate_limiter() -> Self {
        Self::new(RateLimiterConfig::default().build())
    }

    /// Enqueues `item`, merging it into the pending item of the same key if any.
    pub async fn add(&self, item: T) {
        self.enqueue(item, true).await
    }

    /// Enqueues `item` once `delay` has elapsed.
    ///
    /// A delayed item is merged as the older one into an item of the same key
    /// that was added in the meantime.
    pub async fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.enqueue(item, false).await;
        }

        let queue = self.clone();
        ::tokio::spawn(async move {
            sleep(delay).await;
            queue.enqueue(item, false).await
        });
    }

    /// Enqueues `item` after the delay chosen by the rate limiter, counting it
    /// as a retry of its key.
    pub async fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.rate_limiter.when(item.key()).await;
        debug!("requeueing {key} after {delay:?}", key = item.key());
        self.add_after(item, delay).await
    }

    /// Blocks until an item is available, marking its key as processing.
    ///
    /// Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }

                while let Some(key) = state.queue.pop_front() {
                    if let Some(item) = state.dirty.remove(&key) {
                        state.processing.insert(key);
                        return Some(item);
                    }
                }
            }

            notified.await;
        }
    }

    /// Releases the processing mark of `key`, delivering its pending item if
    /// one arrived while it was being processed.
    pub async fn done(&self, key: &T::Key) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);

        if !state.shutting_down && state.dirty.contains_key(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn forget(&self, key: &T::Key) {
        self.rate_limiter.forget(key).await
    }

    pub async fn num_requeues(&self, key: &T::Key) -> usize {
        self.rate_limiter.num_requeues(key).await
    }

    /// Stops accepting items and wakes every blocked [`WorkQueue::get`].
    pub async fn shut_down(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    /// Returns the number of keys waiting to be handed out.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn enqueue(&self, item: T, newer: bool) {
        let mut state = self.state.lock().await;
        let key = item.key().clone();
        if state.shutting_down {
            debug!("dropping {key}: queue is shutting down");
            return;
        }

        if let Some(pending) = state.dirty.get_mut(&key) {
            pending.merge(item, newer);
            return;
        }
        state.dirty.insert(key.clone(), item);

        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }
}
