//! Event sources: where a controller's events come from.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ctrl_core::{Error, ReconcileKey, Result};
use ctrl_workqueue::WorkQueue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::InformerCache;
use crate::event::Event;
use crate::handler::EventHandler;
use crate::predicate::Predicate;

/// Routes events through predicates and a handler into a work queue.
#[derive(Clone)]
pub struct EventDispatch {
    handler: Arc<dyn EventHandler>,
    queue: WorkQueue<ReconcileKey>,
    predicates: Vec<Arc<dyn Predicate>>,
}

impl EventDispatch {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        queue: WorkQueue<ReconcileKey>,
        predicates: Vec<Arc<dyn Predicate>>,
    ) -> Self {
        Self {
            handler,
            queue,
            predicates,
        }
    }

    /// Enqueue the keys the handler maps `event` to, if every predicate
    /// accepts it.
    pub fn dispatch(&self, event: &Event) {
        if !self.predicates.iter().all(|p| p.filter(event)) {
            trace!(key = %event.key(), event = %event.event_type, "Event filtered");
            return;
        }
        for key in self.handler.map(event) {
            trace!(queue = self.queue.name(), key = %key, event = %event.event_type, "Enqueue");
            self.queue.add(key);
        }
    }
}

/// A producer of events for one watch.
#[async_trait]
pub trait Source: Send + Sync {
    /// Begin delivering events to `dispatch` until `token` is cancelled.
    async fn start(&self, dispatch: EventDispatch, token: CancellationToken) -> Result<()>;

    /// Wait until the source has delivered its initial state.
    async fn wait_for_sync(&self, token: &CancellationToken) -> Result<()>;

    /// Short description used in logs.
    fn describe(&self) -> String;
}

/// Events for one kind, taken from the shared informer cache.
pub struct KindSource {
    cache: InformerCache,
    kind: String,
}

impl KindSource {
    pub fn new(cache: InformerCache, kind: impl Into<String>) -> Self {
        Self {
            cache,
            kind: kind.into(),
        }
    }
}

#[async_trait]
impl Source for KindSource {
    async fn start(&self, dispatch: EventDispatch, token: CancellationToken) -> Result<()> {
        let informer = self.cache.informer_for(&self.kind).await;
        informer
            .add_listener(Arc::new(move |event: &Event| dispatch.dispatch(event)))
            .await;
        informer.start(token);
        debug!(kind = %self.kind, "Kind source started");
        Ok(())
    }

    async fn wait_for_sync(&self, token: &CancellationToken) -> Result<()> {
        self.cache
            .informer_for(&self.kind)
            .await
            .wait_for_sync(token)
            .await
    }

    fn describe(&self) -> String {
        format!("kind:{}", self.kind)
    }
}

/// Events pushed by user code through a channel. Always synced.
pub struct ChannelSource {
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl ChannelSource {
    #[must_use]
    pub const fn new(receiver: mpsc::Receiver<Event>) -> Self {
        Self {
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// A source plus the sender feeding it.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Event>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self::new(receiver))
    }
}

#[async_trait]
impl Source for ChannelSource {
    async fn start(&self, dispatch: EventDispatch, token: CancellationToken) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::already_started("channel source"))?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    received = receiver.recv() => match received {
                        Some(event) => dispatch.dispatch(&event),
                        None => break,
                    },
                }
            }
            debug!("Channel source stopped");
        });
        Ok(())
    }

    async fn wait_for_sync(&self, _token: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}
