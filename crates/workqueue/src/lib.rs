//! # Work Queue
//!
//! Deduplicating, rate-limited work queue for reconcile keys.
//!
//! - [`WorkQueue`]: queued / processing / dirty sets with per-key exclusivity
//! - [`RateLimiter`]: per-key exponential backoff and an overall token bucket
//!
//! # Example
//!
//! ```ignore
//! use ctrl_workqueue::WorkQueue;
//!
//! let queue: WorkQueue<String> = WorkQueue::new("deployments");
//! queue.add("default/web".to_string());
//!
//! while let Some(key) = queue.get().await {
//!     match reconcile(&key).await {
//!         Ok(()) => {
//!             queue.forget(&key);
//!             queue.done(&key);
//!         }
//!         Err(_) => {
//!             queue.done(&key);
//!             queue.add_rate_limited(key);
//!         }
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod queue;
pub mod rate_limiter;

pub use queue::{QueueKey, WorkQueue};
pub use rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    RateLimiterConfig,
};
