//! Per-kind informer: a local mirror fed by list-watch.
//!
//! ```text
//! ListWatch ─► watch feed ─┐
//!           └► list ───────┴► mirror (key → object) ─► listeners(Event)
//! ```
//!
//! The feed is opened before the initial listing so no change is missed.
//! Notifications that repeat the mirrored state or carry an older resource
//! version are skipped. A deletion of a mirrored key always applies.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ctrl_core::{Error, Object, ReconcileKey, Result};
use ctrl_workqueue::ItemExponentialFailureRateLimiter;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheConfig;
use crate::event::{Event, WatchEvent, WatchEventType};
use crate::store::ListWatch;

/// Callback receiving every event an informer emits.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct InformerState {
    objects: HashMap<ReconcileKey, Object>,
    listeners: Vec<Listener>,
}

impl InformerState {
    fn emit(&self, event: &Event) {
        for listener in &self.listeners {
            listener(event);
        }
    }
}

/// Local mirror of one kind.
pub struct Informer {
    kind: String,
    list_watch: Arc<dyn ListWatch>,
    config: CacheConfig,
    state: RwLock<InformerState>,
    synced: watch::Sender<bool>,
    started: AtomicBool,
}

impl Informer {
    /// Create an informer for `kind`. It does nothing until started.
    pub fn new(
        kind: impl Into<String>,
        list_watch: Arc<dyn ListWatch>,
        config: CacheConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.into(),
            list_watch,
            config,
            state: RwLock::new(InformerState {
                objects: HashMap::new(),
                listeners: Vec::new(),
            }),
            synced: watch::Sender::new(false),
            started: AtomicBool::new(false),
        })
    }

    /// Kind this informer mirrors.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Whether the initial listing has completed.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Whether `start` has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn the list-watch loop. Subsequent calls are no-ops.
    pub fn start(self: &Arc<Self>, token: CancellationToken) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(kind = %self.kind, "Starting informer");
        let informer = Arc::clone(self);
        tokio::spawn(async move { informer.run(token).await });
    }

    /// Register a listener. It first receives an `Added` event for every
    /// object already mirrored.
    pub async fn add_listener(&self, listener: Listener) {
        let mut state = self.state.write().await;
        let mut existing: Vec<&Object> = state.objects.values().collect();
        existing.sort_by_key(|o| o.key());
        for object in existing {
            listener(&Event::added(object.clone()));
        }
        state.listeners.push(listener);
    }

    /// Wait until the initial listing has completed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if `token` is cancelled first.
    pub async fn wait_for_sync(&self, token: &CancellationToken) -> Result<()> {
        let mut synced = self.synced.subscribe();
        tokio::select! {
            biased;
            result = synced.wait_for(|synced| *synced) => result
                .map(|_| ())
                .map_err(|_| Error::sync_failed(&self.kind, "informer dropped")),
            () = token.cancelled() => Err(Error::Stopped),
        }
    }

    /// Mirrored object for `key`.
    pub async fn get(&self, key: &ReconcileKey) -> Option<Object> {
        self.state.read().await.objects.get(key).cloned()
    }

    /// All mirrored objects, sorted by key.
    pub async fn list(&self) -> Vec<Object> {
        let mut objects: Vec<Object> = self.state.read().await.objects.values().cloned().collect();
        objects.sort_by_key(Object::key);
        objects
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let Some(mut feed) = self.establish(&token).await else {
            debug!(kind = %self.kind, "Informer stopped before sync");
            return;
        };
        self.synced.send_replace(true);
        info!(kind = %self.kind, "Informer synced");

        let mut resync = self.config.resync_period().map(|period| {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                received = feed.recv() => match received {
                    Ok(event) => self.apply(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(kind = %self.kind, missed, "Watch feed lagged, relisting");
                        if !self.relist_until_ok(&token).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!(kind = %self.kind, "Watch feed closed, re-establishing");
                        match self.establish(&token).await {
                            Some(reopened) => feed = reopened,
                            None => break,
                        }
                    }
                },
                () = tick(resync.as_mut()) => self.resync().await,
            }
        }
        info!(kind = %self.kind, "Informer stopped");
    }

    /// Open the feed and complete a listing, retrying until cancelled.
    async fn establish(
        &self,
        token: &CancellationToken,
    ) -> Option<broadcast::Receiver<WatchEvent>> {
        let mut attempt = 0u32;
        loop {
            let outcome = match self.list_watch.watch(&self.kind).await {
                Ok(feed) => self.relist().await.map(|()| feed),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(feed) => return Some(feed),
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(kind = %self.kind, error = %e, attempt, "List-watch failed, retrying");
                    attempt = attempt.saturating_add(1);
                    if !sleep_or_cancel(delay, token).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn relist_until_ok(&self, token: &CancellationToken) -> bool {
        let mut attempt = 0u32;
        loop {
            match self.relist().await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(kind = %self.kind, error = %e, attempt, "Relist failed, retrying");
                    let delay = self.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    if !sleep_or_cancel(delay, token).await {
                        return false;
                    }
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        ItemExponentialFailureRateLimiter::<()>::new(
            self.config.relist_backoff(),
            self.config.relist_backoff_max(),
        )
        .delay_for(attempt)
    }

    /// List the kind and reconcile the mirror against the result.
    async fn relist(&self) -> Result<()> {
        let listed = self.list_watch.list(&self.kind).await?;

        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let mut seen = HashMap::with_capacity(listed.len());

        for object in listed {
            let key = object.key();
            match state.objects.get(&key) {
                Some(old) if *old == object => {}
                Some(old) => events.push(Event::updated(old.clone(), object.clone())),
                None => events.push(Event::added(object.clone())),
            }
            seen.insert(key, object);
        }
        let mut vanished: Vec<&Object> = state
            .objects
            .iter()
            .filter(|(key, _)| !seen.contains_key(*key))
            .map(|(_, object)| object)
            .collect();
        vanished.sort_by_key(|o| o.key());
        events.extend(
            vanished
                .into_iter()
                .map(|last| Event::deleted(last.clone(), Some(last.clone()))),
        );

        debug!(kind = %self.kind, objects = seen.len(), changes = events.len(), "Listed");
        state.objects = seen;
        for event in &events {
            state.emit(event);
        }
        Ok(())
    }

    async fn apply(&self, notification: WatchEvent) {
        let object = notification.object;
        let key = object.key();
        let mut state = self.state.write().await;

        let event = match notification.event_type {
            WatchEventType::Added | WatchEventType::Modified => {
                if state
                    .objects
                    .get(&key)
                    .is_some_and(|current| is_stale(current, &object))
                {
                    return;
                }
                match state.objects.insert(key.clone(), object.clone()) {
                    Some(previous) => Event::updated(previous, object),
                    None => Event::added(object),
                }
            }
            WatchEventType::Deleted => {
                let Some(last_known) = state.objects.remove(&key) else {
                    return;
                };
                Event::deleted(object, Some(last_known))
            }
        };

        debug!(kind = %self.kind, key = %key, event = %event.event_type, "Applying watch event");
        state.emit(&event);
    }

    async fn resync(&self) {
        let state = self.state.read().await;
        let mut objects: Vec<&Object> = state.objects.values().collect();
        objects.sort_by_key(|o| o.key());
        debug!(kind = %self.kind, objects = objects.len(), "Resync");
        for object in objects {
            state.emit(&Event::updated(object.clone(), object.clone()));
        }
    }
}

/// A notification is stale when it repeats the mirrored state or carries an
/// older non-zero resource version. Version 0 means unversioned.
fn is_stale(current: &Object, incoming: &Object) -> bool {
    let version = incoming.metadata.resource_version;
    current == incoming || (version != 0 && version < current.metadata.resource_version)
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Sleep for `delay`; false if cancelled first.
async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::store::InMemoryObjectStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    fn recorder() -> (Listener, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener =
            Arc::new(move |event: &Event| sink.lock().unwrap().push(event.clone()));
        (listener, seen)
    }

    fn deployment(name: &str) -> Object {
        Object::new("apps/v1", "Deployment", "default", name)
    }

    async fn wait_for_events(seen: &Mutex<Vec<Event>>, count: usize) {
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_initial_list_emits_added_and_syncs() {
        let store = InMemoryObjectStore::new_arc();
        store.create(deployment("a")).await.unwrap();
        store.create(deployment("b")).await.unwrap();

        let informer = Informer::new("Deployment", store.clone(), CacheConfig::default());
        let (listener, seen) = recorder();
        informer.add_listener(listener).await;

        let token = CancellationToken::new();
        informer.start(token.clone());
        informer.wait_for_sync(&token).await.unwrap();

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == EventType::Added));
        assert_eq!(informer.list().await.len(), 2);
        token.cancel();
    }

    #[tokio::test]
    async fn test_watch_events_carry_previous_state() {
        let store = InMemoryObjectStore::new_arc();
        let informer = Informer::new("Deployment", store.clone(), CacheConfig::default());
        let (listener, seen) = recorder();
        informer.add_listener(listener).await;

        let token = CancellationToken::new();
        informer.start(token.clone());
        informer.wait_for_sync(&token).await.unwrap();

        let created = store.create(deployment("web")).await.unwrap();
        let updated = store
            .update(created.clone().with_label("app", "web"))
            .await
            .unwrap();
        store.delete("Deployment", &updated.key()).await.unwrap();
        wait_for_events(&seen, 3).await;

        let events = seen.lock().unwrap().clone();
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::Added, EventType::Updated, EventType::Deleted]);
        assert_eq!(events[1].previous_object.as_ref(), Some(&created));
        assert_eq!(events[2].previous_object.as_ref(), Some(&updated));
        assert!(informer.get(&updated.key()).await.is_none());
        token.cancel();
    }

    #[tokio::test]
    async fn test_late_listener_receives_existing_objects() {
        let store = InMemoryObjectStore::new_arc();
        store.create(deployment("web")).await.unwrap();
        let informer = Informer::new("Deployment", store.clone(), CacheConfig::default());
        let token = CancellationToken::new();
        informer.start(token.clone());
        informer.wait_for_sync(&token).await.unwrap();

        let (listener, seen) = recorder();
        informer.add_listener(listener).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_wait_for_sync_fails_when_cancelled() {
        let store = InMemoryObjectStore::new_arc();
        let informer = Informer::new("Deployment", store, CacheConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(informer.wait_for_sync(&token).await, Err(Error::Stopped)));
    }

    struct FlakyListWatch {
        inner: Arc<InMemoryObjectStore>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ListWatch for FlakyListWatch {
        async fn list(&self, kind: &str) -> Result<Vec<Object>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::list_failed(kind, "connection reset"));
            }
            self.inner.list(kind).await
        }

        async fn watch(&self, kind: &str) -> Result<broadcast::Receiver<WatchEvent>> {
            self.inner.watch(kind).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_failures_are_retried() {
        let store = InMemoryObjectStore::new_arc();
        store.create(deployment("web")).await.unwrap();
        let flaky = Arc::new(FlakyListWatch {
            inner: store,
            failures_left: AtomicU32::new(3),
        });
        let informer = Informer::new("Deployment", flaky, CacheConfig::default());
        let token = CancellationToken::new();
        informer.start(token.clone());

        informer.wait_for_sync(&token).await.unwrap();
        assert_eq!(informer.list().await.len(), 1);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_reemits_updates() {
        let store = InMemoryObjectStore::new_arc();
        store.create(deployment("web")).await.unwrap();
        let config = CacheConfig::default().with_resync_period(Duration::from_secs(30));
        let informer = Informer::new("Deployment", store, config);
        let (listener, seen) = recorder();
        informer.add_listener(listener).await;

        let token = CancellationToken::new();
        informer.start(token.clone());
        informer.wait_for_sync(&token).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_for_events(&seen, 2).await;

        let events = seen.lock().unwrap().clone();
        assert!(events.iter().any(|e| e.event_type == EventType::Updated));
        token.cancel();
    }

    /// Upstream that lists a fixed set of objects and hands out a feed the
    /// test drives by hand. Every `watch` call opens a fresh feed.
    struct ManualListWatch {
        listed: Mutex<Vec<Object>>,
        feed: Mutex<Option<broadcast::Sender<WatchEvent>>>,
        watches: AtomicU32,
    }

    impl ManualListWatch {
        fn new(listed: Vec<Object>) -> Arc<Self> {
            Arc::new(Self {
                listed: Mutex::new(listed),
                feed: Mutex::new(None),
                watches: AtomicU32::new(0),
            })
        }

        fn send(&self, event_type: WatchEventType, object: Object) {
            let feed = self.feed.lock().unwrap();
            feed.as_ref()
                .unwrap()
                .send(WatchEvent::new(event_type, object))
                .unwrap();
        }

        fn close_feed(&self) {
            self.feed.lock().unwrap().take();
        }
    }

    #[async_trait]
    impl ListWatch for ManualListWatch {
        async fn list(&self, _kind: &str) -> Result<Vec<Object>> {
            Ok(self.listed.lock().unwrap().clone())
        }

        async fn watch(&self, _kind: &str) -> Result<broadcast::Receiver<WatchEvent>> {
            let (sender, receiver) = broadcast::channel(16);
            *self.feed.lock().unwrap() = Some(sender);
            self.watches.fetch_add(1, Ordering::SeqCst);
            Ok(receiver)
        }
    }

    fn versioned(name: &str, version: u64) -> Object {
        let mut object = deployment(name);
        object.metadata.resource_version = version;
        object
    }

    #[tokio::test]
    async fn test_same_version_changes_and_deletes_are_applied() {
        let original = versioned("web", 7);
        let upstream = ManualListWatch::new(vec![original.clone()]);
        let informer = Informer::new("Deployment", upstream.clone(), CacheConfig::default());
        let (listener, seen) = recorder();
        informer.add_listener(listener).await;

        let token = CancellationToken::new();
        informer.start(token.clone());
        informer.wait_for_sync(&token).await.unwrap();

        let relabeled = original.clone().with_label("app", "web");
        upstream.send(WatchEventType::Modified, relabeled.clone());
        upstream.send(WatchEventType::Deleted, relabeled.clone());
        wait_for_events(&seen, 3).await;

        let events = seen.lock().unwrap().clone();
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::Added, EventType::Updated, EventType::Deleted]);
        assert_eq!(events[1].previous_object.as_ref(), Some(&original));
        assert_eq!(events[2].previous_object.as_ref(), Some(&relabeled));
        assert!(informer.get(&original.key()).await.is_none());
        token.cancel();
    }

    #[tokio::test]
    async fn test_unversioned_updates_are_applied() {
        let original = versioned("web", 0);
        let upstream = ManualListWatch::new(vec![original.clone()]);
        let informer = Informer::new("Deployment", upstream.clone(), CacheConfig::default());
        let (listener, seen) = recorder();
        informer.add_listener(listener).await;

        let token = CancellationToken::new();
        informer.start(token.clone());
        informer.wait_for_sync(&token).await.unwrap();

        upstream.send(WatchEventType::Modified, original.clone().with_label("tier", "a"));
        upstream.send(WatchEventType::Modified, original.clone().with_label("tier", "b"));
        wait_for_events(&seen, 3).await;

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        let mirrored = informer.get(&original.key()).await.unwrap();
        assert_eq!(mirrored.metadata.labels.get("tier").map(String::as_str), Some("b"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_older_version_and_repeated_state_are_skipped() {
        let current = versioned("web", 5);
        let upstream = ManualListWatch::new(vec![current.clone()]);
        let informer = Informer::new("Deployment", upstream.clone(), CacheConfig::default());
        let (listener, seen) = recorder();
        informer.add_listener(listener).await;

        let token = CancellationToken::new();
        informer.start(token.clone());
        informer.wait_for_sync(&token).await.unwrap();

        upstream.send(WatchEventType::Modified, versioned("web", 4).with_label("old", "yes"));
        upstream.send(WatchEventType::Added, current.clone());
        let newer = versioned("web", 6).with_label("new", "yes");
        upstream.send(WatchEventType::Modified, newer.clone());
        wait_for_events(&seen, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].object, newer);
        token.cancel();
    }

    #[tokio::test]
    async fn test_lagged_feed_relists_and_reports_deletions() {
        let store = Arc::new(InMemoryObjectStore::with_feed_capacity(1));
        let doomed = store.create(deployment("doomed")).await.unwrap();
        let informer = Informer::new("Deployment", store.clone(), CacheConfig::default());
        let (listener, seen) = recorder();
        informer.add_listener(listener).await;

        let token = CancellationToken::new();
        informer.start(token.clone());
        informer.wait_for_sync(&token).await.unwrap();

        // The informer cannot run between these calls; the one-slot feed overflows.
        let touched = store
            .update(doomed.clone().with_label("app", "doomed"))
            .await
            .unwrap();
        store.create(deployment("survivor")).await.unwrap();
        store.delete("Deployment", &doomed.key()).await.unwrap();
        for _ in 0..100 {
            if seen.lock().unwrap().iter().any(|e| e.event_type == EventType::Deleted) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let events = seen.lock().unwrap().clone();
        let deleted: Vec<&Event> = events
            .iter()
            .filter(|e| e.event_type == EventType::Deleted)
            .collect();
        assert_eq!(deleted.len(), 1);
        let last_known = deleted[0].previous_object.as_ref().unwrap();
        assert_eq!(last_known.key(), doomed.key());
        assert!(*last_known == doomed || *last_known == touched);
        assert!(informer.get(&doomed.key()).await.is_none());
        assert_eq!(informer.list().await.len(), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_closed_feed_is_reestablished() {
        let upstream = ManualListWatch::new(Vec::new());
        let informer = Informer::new("Deployment", upstream.clone(), CacheConfig::default());
        let (listener, seen) = recorder();
        informer.add_listener(listener).await;

        let token = CancellationToken::new();
        informer.start(token.clone());
        informer.wait_for_sync(&token).await.unwrap();
        assert_eq!(upstream.watches.load(Ordering::SeqCst), 1);

        let listed_later = versioned("web", 1);
        upstream.listed.lock().unwrap().push(listed_later.clone());
        upstream.close_feed();

        for _ in 0..100 {
            if upstream.watches.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        wait_for_events(&seen, 1).await;
        assert_eq!(upstream.watches.load(Ordering::SeqCst), 2);
        assert_eq!(informer.get(&listed_later.key()).await, Some(listed_later.clone()));

        let scaled = versioned("web", 2).with_label("app", "web");
        upstream.send(WatchEventType::Modified, scaled.clone());
        wait_for_events(&seen, 2).await;

        let events = seen.lock().unwrap().clone();
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::Added, EventType::Updated]);
        assert_eq!(informer.get(&scaled.key()).await, Some(scaled));
        token.cancel();
    }
}
