//! Deduplicating work queue.
//!
//! The queue tracks keys in three sets:
//!
//! - **queued**: ready to be handed out by [`WorkQueue::get`]
//! - **processing**: held by exactly one worker until [`WorkQueue::done`]
//! - **dirty**: added again while processing; re-queued on `done`
//!
//! A key is never both queued and processing, so no two workers hold the
//! same key at once. Delayed keys wait in a heap ordered by ready time and
//! are promoted by `get`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::rate_limiter::{ItemExponentialFailureRateLimiter, RateLimiter};

/// Bounds every queue key must satisfy.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueKey for T {}

struct Waiting<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

// Min-heap on (ready_at, seq).
impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Waiting<K> {}

struct QueueState<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    waiting: BinaryHeap<Waiting<K>>,
    waiting_index: HashMap<K, (Instant, u64)>,
    next_seq: u64,
    shutting_down: bool,
}

impl<K: QueueKey> QueueState<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            processing: HashSet::new(),
            dirty: HashSet::new(),
            waiting: BinaryHeap::new(),
            waiting_index: HashMap::new(),
            next_seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the key became ready for `get`.
    fn insert(&mut self, key: K) -> bool {
        if self.queued.contains(&key) || self.dirty.contains(&key) {
            return false;
        }
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        self.queued.insert(key.clone());
        self.queue.push_back(key);
        true
    }

    fn schedule(&mut self, key: K, ready_at: Instant) {
        if let Some((existing, _)) = self.waiting_index.get(&key) {
            if *existing <= ready_at {
                return;
            }
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.waiting_index.insert(key.clone(), (ready_at, seq));
        self.waiting.push(Waiting { ready_at, seq, key });
    }

    fn promote_due(&mut self, now: Instant) {
        while self.waiting.peek().is_some_and(|w| w.ready_at <= now) {
            let Some(entry) = self.waiting.pop() else {
                break;
            };
            // Entries superseded by an earlier schedule are stale.
            if self.waiting_index.get(&entry.key) == Some(&(entry.ready_at, entry.seq)) {
                self.waiting_index.remove(&entry.key);
                self.insert(entry.key);
            }
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.peek().map(|w| w.ready_at)
    }

    fn pop(&mut self) -> Option<K> {
        let key = self.queue.pop_front()?;
        self.queued.remove(&key);
        self.processing.insert(key.clone());
        Some(key)
    }
}

struct Inner<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    rate_limiter: Arc<dyn RateLimiter<K>>,
}

/// A deduplicating, rate-limited queue of reconcile keys.
///
/// Cloning yields another handle to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue with the default per-key exponential backoff.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Arc::new(ItemExponentialFailureRateLimiter::default()))
    }

    /// Create a queue with a custom rate limiter.
    pub fn with_rate_limiter(
        name: impl Into<String>,
        rate_limiter: Arc<dyn RateLimiter<K>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState::new()),
                notify: Notify::new(),
                rate_limiter,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` as needing processing.
    ///
    /// No-op if the key is already queued or dirty, or after shutdown. A key
    /// that is being processed is marked dirty and re-queued on `done`.
    pub fn add(&self, key: K) {
        let ready = {
            let mut state = self.lock();
            if state.shutting_down {
                trace!(queue = %self.inner.name, key = ?key, "Ignoring add after shutdown");
                return;
            }
            state.insert(key)
        };
        if ready {
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let ready_at = Instant::now()
                .checked_add(delay)
                .unwrap_or_else(far_future);
            state.schedule(key, ready_at);
        }
        // Wake a getter so it re-arms its timer for the new deadline.
        self.inner.notify.notify_one();
    }

    /// Add `key` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        debug!(
            queue = %self.inner.name,
            key = ?key,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Requeueing with backoff"
        );
        self.add_after(key, delay);
    }

    /// Reset the rate limiter's failure count for `key`.
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    /// Failures recorded for `key` since the last `forget`.
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down. The returned key is held in
    /// the processing set until [`WorkQueue::done`] is called for it.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.pop() {
                    return Some(key);
                }
                state.next_ready_at()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = notified.as_mut() => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// Release `key` after processing. Re-queues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.remove(key) && !state.shutting_down {
                state.insert(key.clone())
            } else {
                false
            }
        };
        if requeued {
            trace!(queue = %self.inner.name, key = ?key, "Re-queued dirty key");
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every blocked `get`.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.waiting.clear();
            state.waiting_index.clear();
        }
        debug!(queue = %self.inner.name, "Work queue shutting down");
        self.inner.notify.notify_waiters();
    }

    /// Whether `shut_down` has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys ready for `get`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is ready for `get`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers.
    #[must_use]
    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }

    /// Number of keys waiting on a delay.
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.lock().waiting_index.len()
    }
}

impl<K> Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

fn far_future() -> Instant {
    // Roughly 30 years; tokio's timer wheel saturates beyond this anyway.
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}
