#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # ctrl
//!
//! Level-triggered reconciliation engine: watch objects, map changes to
//! keys, reconcile each key until it converges, retry with backoff.
//!
//! This library re-exports the workspace crates for convenience:
//!
//! - [`ctrl_core`]: keys, objects, errors
//! - [`ctrl_workqueue`]: deduplicating rate-limited work queue
//! - [`ctrl_events`]: list-watch, informers, sources, handlers, predicates
//! - [`ctrl_reconciler`]: controllers and the controller manager

pub use ctrl_core;
pub use ctrl_events;
pub use ctrl_reconciler;
pub use ctrl_workqueue;

pub mod demo;
pub mod prelude;
