//! Rate limiters deciding how long a failed key waits before it is retried.
//!
//! The delay for a key after `n` consecutive failures is `base × 2^n`,
//! clamped to `max`. `forget` resets the count, so the next failure starts
//! again from `base`. An overall token bucket bounds the retry rate across
//! all keys.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ctrl_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Decides how long an item waits before it is re-queued.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be processed again. Records a failure.
    fn when(&self, item: &K) -> Duration;

    /// Stop tracking `item`; its next delay starts from the base again.
    fn forget(&self, item: &K);

    /// Number of failures recorded for `item`.
    fn num_requeues(&self, item: &K) -> u32;
}

/// Per-item exponential backoff.
pub struct ItemExponentialFailureRateLimiter<K> {
    failures: Mutex<HashMap<K, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K: Eq + Hash> ItemExponentialFailureRateLimiter<K> {
    /// Create a limiter with the given base and cap.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }

    /// Delay for the given number of prior failures.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl<K: Eq + Hash> Default for ItemExponentialFailureRateLimiter<K> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<K: Clone + Eq + Hash + Send + Sync> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let delay = self.delay_for(*count);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, item: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every item.
///
/// Does not track items: `forget` is a no-op and `num_requeues` is zero.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a bucket refilled at `qps` tokens per second holding at most `burst`.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = elapsed.mul_add(self.qps, bucket.tokens).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Returns the longest delay of its members.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Arc<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Combine several limiters.
    #[must_use]
    pub fn new(limiters: Vec<Arc<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        // Every member must observe the failure, so no short-circuiting.
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &K) {
        self.limiters.iter().for_each(|l| l.forget(item));
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Serializable rate limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Delay after the first failure of a key.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the per-key delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Overall retry rate across all keys.
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Overall burst size.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

const fn default_base_delay_ms() -> u64 {
    5
}

const fn default_max_delay_ms() -> u64 {
    1_000_000
}

const fn default_qps() -> f64 {
    10.0
}

const fn default_burst() -> u32 {
    100
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl RateLimiterConfig {
    /// Set the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = saturating_millis(delay);
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = saturating_millis(delay);
        self
    }

    /// Set the overall bucket rate.
    #[must_use]
    pub const fn with_bucket(mut self, qps: f64, burst: u32) -> Self {
        self.qps = qps;
        self.burst = burst;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if a delay is zero, the base exceeds the
    /// cap, or the bucket parameters are not positive.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(Error::invalid_config("base_delay_ms must be greater than 0"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::invalid_config(format!(
                "base_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(Error::invalid_config("qps must be a positive number"));
        }
        if self.burst == 0 {
            return Err(Error::invalid_config("burst must be greater than 0"));
        }
        Ok(())
    }

    /// Build the controller default: per-key exponential backoff bounded by
    /// an overall token bucket.
    #[must_use]
    pub fn build<K>(&self) -> Arc<dyn RateLimiter<K>>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
    {
        let exponential: Arc<dyn RateLimiter<K>> = Arc::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        ));
        let bucket: Arc<dyn RateLimiter<K>> =
            Arc::new(BucketRateLimiter::new(self.qps, self.burst));
        Arc::new(MaxOfRateLimiter::new(vec![exponential, bucket]))
    }
}

const fn saturating_millis(delay: Duration) -> u64 {
    let millis = delay.as_millis();
    if millis > u64::MAX as u128 {
        u64::MAX
    } else {
        millis as u64
    }
}
