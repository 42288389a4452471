//! Object change events and the plumbing that turns them into reconcile keys.
//!
//! This crate sits between an upstream object source and the work queues:
//!
//! - **List-watch**: [`ListWatch`] contract plus [`InMemoryObjectStore`]
//! - **Informers**: per-kind local mirrors shared through [`InformerCache`]
//! - **Sources**: [`KindSource`] (informer-backed) and [`ChannelSource`]
//! - **Handlers**: map events to keys ([`EnqueueHandler`], [`EnqueueOwnerHandler`],
//!   [`EnqueueMappedHandler`])
//! - **Predicates**: drop events before they reach a handler
//!
//! # Example
//!
//! ```ignore
//! use ctrl_events::{EnqueueHandler, EventDispatch, InMemoryObjectStore, InformerCache, KindSource, Source};
//! use ctrl_workqueue::WorkQueue;
//! use std::sync::Arc;
//!
//! let store = InMemoryObjectStore::new_arc();
//! let cache = InformerCache::new(store, Default::default());
//! cache.start(token.clone()).await?;
//!
//! let queue = WorkQueue::new("deployments");
//! let source = KindSource::new(cache, "Deployment");
//! source
//!     .start(EventDispatch::new(Arc::new(EnqueueHandler), queue.clone(), vec![]), token.clone())
//!     .await?;
//! source.wait_for_sync(&token).await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cache;
pub mod event;
pub mod handler;
pub mod informer;
pub mod predicate;
pub mod source;
pub mod store;

pub use cache::{CacheConfig, InformerCache};
pub use event::{Event, EventType, WatchEvent, WatchEventType};
pub use handler::{EnqueueHandler, EnqueueMappedHandler, EnqueueOwnerHandler, EventHandler};
pub use informer::{Informer, Listener};
pub use predicate::{FnPredicate, GenerationChangedPredicate, LabelSelectorPredicate, Predicate};
pub use source::{ChannelSource, EventDispatch, KindSource, Source};
pub use store::{DEFAULT_FEED_CAPACITY, InMemoryObjectStore, ListWatch, TracingListWatch};
