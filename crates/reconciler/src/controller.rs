//! Controller: one work queue, one reconciler, many watches.
//!
//! ```text
//! Source ─► Predicate* ─► EventHandler ─► WorkQueue ─► worker × N ─► Reconciler
//!                                             ▲                          │
//!                                             └──── requeue / backoff ◄──┘
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use ctrl_core::{Error, ReconcileKey, Result};
use ctrl_events::{EventDispatch, EventHandler, Predicate, Source};
use ctrl_workqueue::WorkQueue;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::reconcile::{ReconcileRequest, Reconciler};

/// Lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    /// Accepting watch registrations.
    Initializing,
    /// Sources started, waiting for their initial state.
    WaitingForSync,
    /// Workers are processing keys.
    Running,
    /// Queue shut down, in-flight reconciles draining.
    Stopping,
    Stopped,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::WaitingForSync => "waiting_for_sync",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct Watch {
    source: Arc<dyn Source>,
    handler: Arc<dyn EventHandler>,
    predicates: Vec<Arc<dyn Predicate>>,
}

/// A named reconcile loop.
pub struct Controller {
    name: String,
    config: ControllerConfig,
    queue: WorkQueue<ReconcileKey>,
    reconciler: Arc<dyn Reconciler>,
    watches: Vec<Watch>,
    state: watch::Sender<ControllerState>,
}

impl Controller {
    /// Create a controller with the default configuration.
    pub fn new(name: impl Into<String>, reconciler: Arc<dyn Reconciler>) -> Self {
        let name = name.into();
        let config = ControllerConfig::default();
        let queue = WorkQueue::with_rate_limiter(name.clone(), config.rate_limiter.build());
        Self {
            name,
            config,
            queue,
            reconciler,
            watches: Vec::new(),
            state: watch::Sender::new(ControllerState::Initializing),
        }
    }

    /// Create a controller with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` does not validate.
    pub fn with_config(
        name: impl Into<String>,
        reconciler: Arc<dyn Reconciler>,
        config: ControllerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut controller = Self::new(name, reconciler);
        controller.queue =
            WorkQueue::with_rate_limiter(controller.name.clone(), config.rate_limiter.build());
        controller.config = config;
        Ok(controller)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Handle to the controller's queue.
    #[must_use]
    pub fn queue(&self) -> WorkQueue<ReconcileKey> {
        self.queue.clone()
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Register a source whose events `handler` maps to keys.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyStarted` once the controller has started.
    pub fn watch<S, H>(&mut self, source: S, handler: H) -> Result<()>
    where
        S: Source + 'static,
        H: EventHandler + 'static,
    {
        self.watch_with_predicates(source, handler, Vec::new())
    }

    /// Like [`Controller::watch`], dropping events any predicate rejects.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyStarted` once the controller has started.
    pub fn watch_with_predicates<S, H>(
        &mut self,
        source: S,
        handler: H,
        predicates: Vec<Arc<dyn Predicate>>,
    ) -> Result<()>
    where
        S: Source + 'static,
        H: EventHandler + 'static,
    {
        if self.state() != ControllerState::Initializing {
            return Err(Error::already_started(format!("controller {}", self.name)));
        }
        debug!(controller = %self.name, source = %source.describe(), "Watch registered");
        self.watches.push(Watch {
            source: Arc::new(source),
            handler: Arc::new(handler),
            predicates,
        });
        Ok(())
    }

    fn set_state(&self, next: ControllerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                controller = %self.name,
                from = %previous,
                to = %next,
                "Controller state changed"
            );
        }
    }

    /// Start every registered source.
    pub(crate) async fn start_watches(&self, token: &CancellationToken) -> Result<()> {
        if self.state() != ControllerState::Initializing {
            return Err(Error::already_started(format!("controller {}", self.name)));
        }
        self.set_state(ControllerState::WaitingForSync);
        info!(controller = %self.name, watches = self.watches.len(), "Starting watches");
        for watch in &self.watches {
            let dispatch = EventDispatch::new(
                Arc::clone(&watch.handler),
                self.queue.clone(),
                watch.predicates.clone(),
            );
            watch.source.start(dispatch, token.clone()).await?;
        }
        Ok(())
    }

    /// Wait for every source to sync within `timeout`.
    pub(crate) async fn wait_for_sync(
        &self,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<()> {
        let all_synced = async {
            for watch in &self.watches {
                watch.source.wait_for_sync(token).await?;
            }
            Ok::<(), Error>(())
        };
        tokio::time::timeout(timeout, all_synced)
            .await
            .map_err(|_| Error::sync_timeout(timeout))??;
        info!(controller = %self.name, "Sources synced");
        Ok(())
    }

    /// Spawn `max_concurrent_reconciles` workers.
    pub(crate) fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        self.set_state(ControllerState::Running);
        info!(
            controller = %self.name,
            workers = self.config.max_concurrent_reconciles,
            "Starting workers"
        );
        (0..self.config.max_concurrent_reconciles)
            .map(|worker| {
                let name = self.name.clone();
                let queue = self.queue.clone();
                let reconciler = Arc::clone(&self.reconciler);
                tokio::spawn(async move {
                    while process_next(&name, &queue, reconciler.as_ref()).await {}
                    debug!(controller = %name, worker, "Worker exited");
                })
            })
            .collect()
    }

    /// Close the queue. Blocked workers exit; in-flight reconciles finish.
    pub(crate) fn shut_down(&self) {
        if matches!(self.state(), ControllerState::Stopping | ControllerState::Stopped) {
            return;
        }
        info!(controller = %self.name, "Stopping controller");
        self.set_state(ControllerState::Stopping);
        self.queue.shut_down();
    }

    pub(crate) fn mark_stopped(&self) {
        self.queue.shut_down();
        self.set_state(ControllerState::Stopped);
    }

    /// Run this controller on its own until `token` is cancelled.
    ///
    /// Sources backed by an informer cache start their informers directly;
    /// the cache itself is not started.
    ///
    /// # Errors
    ///
    /// Fails if the controller already started or its sources do not sync
    /// within `sync_timeout`. No worker runs in that case.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Stopped);
        }
        let sources = token.child_token();
        let ready = match self.start_watches(&sources).await {
            Ok(()) => self.wait_for_sync(&sources, self.config.sync_timeout()).await,
            Err(e) => Err(e),
        };
        let ready = match ready {
            Ok(()) if token.is_cancelled() => Err(Error::Stopped),
            other => other,
        };
        if let Err(e) = ready {
            error!(controller = %self.name, error = %e, "Controller failed to start");
            sources.cancel();
            self.mark_stopped();
            return Err(e);
        }

        let workers = self.spawn_workers();
        token.cancelled().await;

        self.shut_down();
        sources.cancel();
        drain_workers(&self.name, workers, self.config.shutdown_timeout()).await;
        self.mark_stopped();
        info!(controller = %self.name, "Controller stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("watches", &self.watches.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Process one key. False once the queue is shut down.
async fn process_next(
    name: &str,
    queue: &WorkQueue<ReconcileKey>,
    reconciler: &dyn Reconciler,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };
    debug!(controller = name, key = %key, "Reconciling");

    let outcome = AssertUnwindSafe(reconciler.reconcile(ReconcileRequest::new(key.clone())))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            error!(controller = name, key = %key, panic = %message, "Reconciler panicked");
            Err(Error::reconcile_panicked(&key, message))
        });

    match outcome {
        Ok(result) => {
            queue.forget(&key);
            queue.done(&key);
            if let Some(delay) = result.requeue_after {
                debug!(controller = name, key = %key, delay_ms = millis(delay), "Requeue after");
                queue.add_after(key, delay);
            } else if result.requeue {
                debug!(controller = name, key = %key, "Requeue");
                queue.add(key);
            } else {
                debug!(controller = name, key = %key, "Reconciled");
            }
        }
        Err(e) => {
            warn!(
                controller = name,
                key = %key,
                error = %e,
                retries = queue.num_requeues(&key),
                "Reconcile failed, backing off"
            );
            queue.done(&key);
            queue.add_rate_limited(key);
        }
    }
    true
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Await `workers` until `timeout` elapses, aborting whatever is left.
pub(crate) async fn drain_workers(
    controller: &str,
    workers: Vec<JoinHandle<()>>,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut aborted = 0usize;
    for mut worker in workers {
        match tokio::time::timeout_at(deadline, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(controller, error = %e, "Worker task failed"),
            Err(_) => {
                worker.abort();
                aborted += 1;
            }
        }
    }
    if aborted > 0 {
        warn!(
            controller,
            aborted,
            timeout_ms = millis(timeout),
            "Workers did not drain in time, aborted"
        );
    }
}
