//! Level-triggered reconcile loops.
//!
//! This crate runs user [`Reconciler`]s against keys produced by watches:
//!
//! - **Controller**: one work queue, one reconciler, N workers; retries
//!   failures with per-key backoff and survives reconciler panics
//! - **ControllerManager**: shared informer cache, two-phase registration,
//!   fail-fast start and bounded graceful shutdown
//! - **Config**: serde/TOML settings for controllers and the manager
//!
//! # Key Concepts
//!
//! Reconciles are driven by keys, not by event payloads. Several events for
//! a key that has not been picked up yet collapse into one reconcile, and a
//! key is never reconciled by two workers at once.
//!
//! # Example
//!
//! ```ignore
//! use ctrl_events::{EnqueueHandler, EnqueueOwnerHandler, InMemoryObjectStore, KindSource};
//! use ctrl_reconciler::{Controller, ControllerManager, ManagerConfig, ReconcileFn, ReconcileResult};
//! use std::sync::Arc;
//!
//! let store = InMemoryObjectStore::new_arc();
//! let manager = ControllerManager::new(store, ManagerConfig::default())?;
//!
//! let reconciler = ReconcileFn::new(|request| async move {
//!     tracing::info!(key = %request.key, "reconcile");
//!     Ok(ReconcileResult::done())
//! });
//!
//! manager.add_controller(Controller::new("deployments", Arc::new(reconciler)), |c, cache| {
//!     c.watch(KindSource::new(cache.clone(), "Deployment"), EnqueueHandler)?;
//!     c.watch(
//!         KindSource::new(cache.clone(), "ReplicaSet"),
//!         EnqueueOwnerHandler::new("Deployment"),
//!     )
//! })?;
//!
//! manager.start(token).await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod controller;
pub mod manager;
pub mod reconcile;
pub mod shutdown;

pub use config::{ControllerConfig, ManagerConfig};
pub use controller::{Controller, ControllerState};
pub use ctrl_core::{Error, Result};
pub use manager::{ControllerManager, DeferredInit};
pub use reconcile::{ReconcileFn, ReconcileRequest, ReconcileResult, Reconciler};
pub use shutdown::{ShutdownSignal, install_signal_handlers, wait_for_signal};
