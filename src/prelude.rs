//! Prelude module - common imports for writing controllers
//!
//! ```rust,ignore
//! use ctrl::prelude::*;
//! ```

pub use ctrl_core::{Error, Object, ObjectMeta, OwnerReference, ReconcileKey, Result};
pub use ctrl_events::{
    CacheConfig, ChannelSource, EnqueueHandler, EnqueueMappedHandler, EnqueueOwnerHandler, Event,
    EventHandler, EventType, GenerationChangedPredicate, InMemoryObjectStore, InformerCache,
    KindSource, LabelSelectorPredicate, ListWatch, Predicate, Source,
};
pub use ctrl_reconciler::{
    Controller, ControllerConfig, ControllerManager, ControllerState, ManagerConfig, ReconcileFn,
    ReconcileRequest, ReconcileResult, Reconciler,
};
pub use ctrl_workqueue::{RateLimiter, RateLimiterConfig, WorkQueue};
pub use tokio_util::sync::CancellationToken;
