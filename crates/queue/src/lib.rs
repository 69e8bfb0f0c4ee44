//! kwatch work queue: deduplicating FIFO of keys with per-key processing locks
//! and rate-limited requeues.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

mod rate_limiter;

pub use rate_limiter::{default_controller_rate_limiter, ExponentialBackoff, MaxOf, RateLimiter, TokenBucket};

/// Anything that can identify a unit of work.
pub trait QueueItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueItem for T {}

struct State<T> {
    /// Pending items in delivery order.
    queue: VecDeque<T>,
    /// Items waiting to be processed. Superset of `queue`: an item re-added while
    /// in processing sits here until `done`.
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    shutdown: CancellationToken,
}

/// Cloneable handle; all clones share the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: QueueItem> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new(default_controller_rate_limiter())
    }
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Enqueue `item`. No-op if it is already pending or the queue is shutting down.
    pub fn add(&self, item: T) {
        let mut st = self.inner.state.lock();
        if st.shutting_down {
            return;
        }
        if st.dirty.contains(&item) {
            trace!(item = ?item, "already pending");
            return;
        }
        st.dirty.insert(item.clone());
        counter!("kwatch_queue_adds_total", 1u64);
        if st.processing.contains(&item) {
            // redelivered by `done`
            return;
        }
        st.queue.push_back(item);
        gauge!("kwatch_queue_depth", st.queue.len() as f64);
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item and mark it in processing.
    ///
    /// Returns `None` once the queue is shutting down. The caller must hand the item back
    /// with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.inner.state.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    gauge!("kwatch_queue_depth", st.queue.len() as f64);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release the processing lock on `item`, requeueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut st = self.inner.state.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.queue.push_back(item.clone());
            gauge!("kwatch_queue_depth", st.queue.len() as f64);
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed. Pending delays are dropped on shutdown.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = queue.inner.shutdown.cancelled() => {}
            }
        });
    }

    /// Requeue after the rate limiter's delay; counts as one retry.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        counter!("kwatch_queue_retries_total", 1u64);
        debug!(item = ?item, delay_ms = delay.as_millis() as u64, "requeue rate limited");
        self.add_after(item, delay);
    }

    /// Clear retry history for `item`.
    pub fn forget(&self, item: &T) {
        self.inner.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Wake every waiting `get`; they and all later calls return `None`.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of items waiting for delivery (excludes items in processing).
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
