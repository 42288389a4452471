//! Controller manager: owns the shared cache and runs every controller.
//!
//! Registration is two-phase. `add_controller` declares a controller and a
//! deferred initializer; the initializer runs during `start`, after the
//! shared cache has synced, and is where watches are wired up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ctrl_core::{Error, Result};
use ctrl_events::{InformerCache, ListWatch};
use futures::future::{join_all, try_join_all};
use itertools::Itertools;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ManagerConfig;
use crate::controller::{Controller, drain_workers};

/// Wires a controller once the shared cache is ready.
pub type DeferredInit = Box<dyn FnOnce(&mut Controller, &InformerCache) -> Result<()> + Send>;

struct Registration {
    controller: Controller,
    init: Option<DeferredInit>,
}

/// Runs a set of controllers over one shared informer cache.
pub struct ControllerManager {
    config: ManagerConfig,
    cache: InformerCache,
    registrations: Mutex<Vec<Registration>>,
    started: AtomicBool,
}

impl ControllerManager {
    /// Create a manager whose cache reads from `list_watch`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` does not validate.
    pub fn new(list_watch: Arc<dyn ListWatch>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let cache = InformerCache::new(list_watch, config.cache.clone());
        Ok(Self {
            config,
            cache,
            registrations: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The shared informer cache.
    #[must_use]
    pub const fn cache(&self) -> &InformerCache {
        &self.cache
    }

    /// Names of the registered controllers, in registration order.
    #[must_use]
    pub fn controller_names(&self) -> Vec<String> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.controller.name().to_string())
            .collect()
    }

    /// Register `controller`; `init` runs during `start`, after cache sync.
    ///
    /// # Errors
    ///
    /// `Error::ControllerExists` for a duplicate name, `Error::AlreadyStarted`
    /// once the manager has started.
    pub fn add_controller<F>(&self, controller: Controller, init: F) -> Result<()>
    where
        F: FnOnce(&mut Controller, &InformerCache) -> Result<()> + Send + 'static,
    {
        let mut registrations = self.registrations.lock().unwrap_or_else(PoisonError::into_inner);
        if self.started.load(Ordering::Acquire) {
            return Err(Error::already_started("controller manager"));
        }
        if registrations
            .iter()
            .any(|r| r.controller.name() == controller.name())
        {
            return Err(Error::controller_exists(controller.name()));
        }
        info!(controller = %controller.name(), "Controller registered");
        registrations.push(Registration {
            controller,
            init: Some(Box::new(init)),
        });
        Ok(())
    }

    fn take_registrations(&self) -> Result<Vec<Registration>> {
        let mut registrations = self.registrations.lock().unwrap_or_else(PoisonError::into_inner);
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::already_started("controller manager"));
        }
        Ok(std::mem::take(&mut *registrations))
    }

    /// Run every controller until `token` is cancelled.
    ///
    /// Returns `Ok(())` after a clean shutdown. Workers still busy when
    /// `shutdown_timeout` elapses are aborted.
    ///
    /// # Errors
    ///
    /// `Error::Stopped` if `token` is cancelled before workers start, and any
    /// cache, initializer or source failure. No worker runs
    /// when an error is returned.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Stopped);
        }
        let registrations = self.take_registrations()?;
        let run = token.child_token();
        let mut controllers = Vec::with_capacity(registrations.len());

        let prepared = match self.prepare(registrations, &mut controllers, &run).await {
            Ok(()) if token.is_cancelled() => Err(Error::Stopped),
            other => other,
        };
        if let Err(e) = prepared {
            error!(error = %e, "Controller manager failed to start");
            run.cancel();
            for controller in &controllers {
                controller.mark_stopped();
            }
            return Err(e);
        }

        let workers: Vec<(String, Vec<JoinHandle<()>>)> = controllers
            .iter()
            .map(|c| (c.name().to_string(), c.spawn_workers()))
            .collect();
        info!(
            controllers = %controllers.iter().map(Controller::name).join(","),
            "Controller manager running"
        );

        token.cancelled().await;
        info!("Controller manager stopping");

        for controller in &controllers {
            controller.shut_down();
        }
        run.cancel();

        let timeout = self.config.shutdown_timeout();
        join_all(
            workers
                .into_iter()
                .map(|(name, handles)| async move { drain_workers(&name, handles, timeout).await }),
        )
        .await;

        for controller in &controllers {
            controller.mark_stopped();
        }
        info!("Controller manager stopped");
        Ok(())
    }

    /// Steps before any worker starts: cache sync, deferred inits, watches,
    /// source sync.
    async fn prepare(
        &self,
        registrations: Vec<Registration>,
        controllers: &mut Vec<Controller>,
        run: &CancellationToken,
    ) -> Result<()> {
        let sync_timeout = self.config.sync_timeout();

        self.cache.start(run.clone()).await?;
        tokio::time::timeout(sync_timeout, self.cache.wait_for_sync(run))
            .await
            .map_err(|_| Error::sync_timeout(sync_timeout))??;

        for Registration { mut controller, init } in registrations {
            if let Some(init) = init {
                init(&mut controller, &self.cache)?;
            }
            controllers.push(controller);
        }

        for controller in controllers.iter() {
            controller.start_watches(run).await?;
        }

        try_join_all(
            controllers
                .iter()
                .map(|controller| controller.wait_for_sync(run, sync_timeout)),
        )
        .await?;
        info!(controllers = controllers.len(), "All sources synced");
        Ok(())
    }
}

impl std::fmt::Debug for ControllerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerManager")
            .field("config", &self.config)
            .field("controllers", &self.controller_names())
            .field("started", &self.started.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
