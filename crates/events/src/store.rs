//! List-watch trait and the in-memory object store.
//!
//! [`ListWatch`] is the contract the informers consume: an initial listing
//! per kind plus an incremental feed of watch notifications. Reconnects and
//! retries of a real upstream belong to the implementation, not the core.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use ctrl_core::{Error, Object, ReconcileKey, Result};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::event::{WatchEvent, WatchEventType};

/// Default capacity of each per-kind watch feed.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Upstream source of objects for one or more kinds.
///
/// Resource versions order the states of one object. A non-zero version
/// lower than the mirrored one marks a notification as stale; version 0
/// means the upstream does not version objects and every change applies.
/// `Deleted` notifications are authoritative for a mirrored key whatever
/// their version.
#[async_trait]
pub trait ListWatch: Send + Sync {
    /// List every object of `kind`.
    async fn list(&self, kind: &str) -> Result<Vec<Object>>;

    /// Subscribe to changes of `kind`.
    async fn watch(&self, kind: &str) -> Result<broadcast::Receiver<WatchEvent>>;
}

/// In-memory object store with per-kind watch feeds.
///
/// Assigns uids, creation timestamps and monotonically increasing resource
/// versions. `generation` increases whenever the payload changes.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, HashMap<ReconcileKey, Object>>>,
    feeds: RwLock<HashMap<String, broadcast::Sender<WatchEvent>>>,
    resource_version: AtomicU64,
    feed_capacity: usize,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }
}

impl InMemoryObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store wrapped in an Arc.
    #[must_use]
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create a store whose watch feeds retain `capacity` notifications.
    #[must_use]
    pub fn with_feed_capacity(capacity: usize) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            feeds: RwLock::new(HashMap::new()),
            resource_version: AtomicU64::new(0),
            feed_capacity: capacity.max(1),
        }
    }

    fn next_resource_version(&self) -> u64 {
        self.resource_version
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1)
    }

    async fn publish(&self, event_type: WatchEventType, object: Object) {
        let feeds = self.feeds.read().await;
        if let Some(sender) = feeds.get(&object.kind) {
            // No subscribers is fine: informers list on start.
            let _ = sender.send(WatchEvent::new(event_type, object));
        }
    }

    /// Create an object. Returns the stored copy.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyExists` if an object with the same kind and key
    /// is present.
    pub async fn create(&self, mut object: Object) -> Result<Object> {
        let key = object.key();
        let mut objects = self.objects.write().await;
        let by_key = objects.entry(object.kind.clone()).or_default();
        if by_key.contains_key(&key) {
            return Err(Error::already_exists(format!("{} {key}", object.kind)));
        }

        object.metadata.uid = Uuid::new_v4().to_string();
        object.metadata.resource_version = self.next_resource_version();
        object.metadata.generation = 1;
        object.metadata.creation_timestamp = Some(Utc::now());
        by_key.insert(key, object.clone());

        tracing::debug!(
            kind = %object.kind,
            key = %object.key(),
            resource_version = object.metadata.resource_version,
            "Object created"
        );
        self.publish(WatchEventType::Added, object.clone()).await;
        Ok(object)
    }

    /// Replace an existing object. Returns the stored copy.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no object with the same kind and key
    /// exists.
    pub async fn update(&self, mut object: Object) -> Result<Object> {
        let key = object.key();
        let mut objects = self.objects.write().await;
        let existing = objects
            .get_mut(&object.kind)
            .and_then(|by_key| by_key.get_mut(&key))
            .ok_or_else(|| Error::not_found(format!("{} {key}", object.kind)))?;

        object.metadata.uid.clone_from(&existing.metadata.uid);
        object.metadata.creation_timestamp = existing.metadata.creation_timestamp;
        object.metadata.generation = if object.data == existing.data {
            existing.metadata.generation
        } else {
            existing.metadata.generation.saturating_add(1)
        };
        object.metadata.resource_version = self.next_resource_version();
        *existing = object.clone();

        tracing::debug!(
            kind = %object.kind,
            key = %key,
            resource_version = object.metadata.resource_version,
            generation = object.metadata.generation,
            "Object updated"
        );
        self.publish(WatchEventType::Modified, object.clone()).await;
        Ok(object)
    }

    /// Delete an object. Returns its final state.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such object exists.
    pub async fn delete(&self, kind: &str, key: &ReconcileKey) -> Result<Object> {
        let mut objects = self.objects.write().await;
        let mut removed = objects
            .get_mut(kind)
            .and_then(|by_key| by_key.remove(key))
            .ok_or_else(|| Error::not_found(format!("{kind} {key}")))?;

        removed.metadata.resource_version = self.next_resource_version();

        tracing::debug!(kind, key = %key, "Object deleted");
        self.publish(WatchEventType::Deleted, removed.clone()).await;
        Ok(removed)
    }

    /// Fetch one object.
    pub async fn get(&self, kind: &str, key: &ReconcileKey) -> Option<Object> {
        self.objects
            .read()
            .await
            .get(kind)
            .and_then(|by_key| by_key.get(key))
            .cloned()
    }
}

#[async_trait]
impl ListWatch for InMemoryObjectStore {
    async fn list(&self, kind: &str) -> Result<Vec<Object>> {
        let objects = self.objects.read().await;
        let mut listed: Vec<Object> = objects
            .get(kind)
            .map(|by_key| by_key.values().cloned().collect())
            .unwrap_or_default();
        listed.sort_by_key(Object::key);
        Ok(listed)
    }

    async fn watch(&self, kind: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        let mut feeds = self.feeds.write().await;
        let sender = feeds
            .entry(kind.to_string())
            .or_insert_with(|| broadcast::channel(self.feed_capacity).0);
        Ok(sender.subscribe())
    }
}

/// A wrapper that adds tracing to a list-watch implementation.
pub struct TracingListWatch<L: ListWatch> {
    inner: L,
}

impl<L: ListWatch> TracingListWatch<L> {
    /// Create a new tracing wrapper.
    pub const fn new(inner: L) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<L: ListWatch> ListWatch for TracingListWatch<L> {
    async fn list(&self, kind: &str) -> Result<Vec<Object>> {
        tracing::debug!(kind, "Listing objects");
        let result = self.inner.list(kind).await;
        match result {
            Ok(ref objects) => tracing::trace!(kind, count = objects.len(), "Listed objects"),
            Err(ref e) => tracing::warn!(kind, error = %e, "List failed"),
        }
        result
    }

    async fn watch(&self, kind: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        tracing::debug!(kind, "Opening watch");
        self.inner.watch(kind).await
    }
}

#[async_trait]
impl<L: ListWatch + ?Sized> ListWatch for Arc<L> {
    async fn list(&self, kind: &str) -> Result<Vec<Object>> {
        (**self).list(kind).await
    }

    async fn watch(&self, kind: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        (**self).watch(kind).await
    }
}
