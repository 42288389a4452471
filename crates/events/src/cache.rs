//! Shared informer cache.
//!
//! One informer per kind, created lazily and shared by every controller
//! that watches or reads that kind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ctrl_core::{Error, Object, ReconcileKey, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::informer::Informer;
use crate::store::ListWatch;

fn default_relist_backoff_ms() -> u64 {
    100
}

fn default_relist_backoff_max_ms() -> u64 {
    30_000
}

/// Informer cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Period at which every mirrored object is re-delivered as an update.
    /// Disabled when absent.
    #[serde(default)]
    pub resync_period_ms: Option<u64>,

    /// First delay after a failed list or watch.
    #[serde(default = "default_relist_backoff_ms")]
    pub relist_backoff_ms: u64,

    /// Upper bound on the relist delay.
    #[serde(default = "default_relist_backoff_max_ms")]
    pub relist_backoff_max_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resync_period_ms: None,
            relist_backoff_ms: default_relist_backoff_ms(),
            relist_backoff_max_ms: default_relist_backoff_max_ms(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period_ms = Some(duration_ms(period));
        self
    }

    #[must_use]
    pub const fn with_relist_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.relist_backoff_ms = duration_ms(base);
        self.relist_backoff_max_ms = duration_ms(max);
        self
    }

    #[must_use]
    pub fn resync_period(&self) -> Option<Duration> {
        self.resync_period_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    #[must_use]
    pub const fn relist_backoff(&self) -> Duration {
        Duration::from_millis(self.relist_backoff_ms)
    }

    #[must_use]
    pub const fn relist_backoff_max(&self) -> Duration {
        Duration::from_millis(self.relist_backoff_max_ms)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the backoff bounds are zero or
    /// inverted.
    pub fn validate(&self) -> Result<()> {
        if self.relist_backoff_ms == 0 {
            return Err(Error::invalid_config("cache.relist_backoff_ms must be positive"));
        }
        if self.relist_backoff_max_ms < self.relist_backoff_ms {
            return Err(Error::invalid_config(
                "cache.relist_backoff_max_ms must be >= cache.relist_backoff_ms",
            ));
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

struct CacheInner {
    list_watch: Arc<dyn ListWatch>,
    config: CacheConfig,
    informers: RwLock<HashMap<String, Arc<Informer>>>,
    token: Mutex<Option<CancellationToken>>,
}

/// Shared, lazily populated set of informers keyed by kind.
#[derive(Clone)]
pub struct InformerCache {
    inner: Arc<CacheInner>,
}

impl InformerCache {
    /// Create a cache reading from `list_watch`.
    pub fn new(list_watch: Arc<dyn ListWatch>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                list_watch,
                config,
                informers: RwLock::new(HashMap::new()),
                token: Mutex::new(None),
            }),
        }
    }

    fn started_token(&self) -> Option<CancellationToken> {
        self.inner
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether `start` has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started_token().is_some()
    }

    /// Informer for `kind`, created on first request. Informers created
    /// after the cache started are started immediately.
    pub async fn informer_for(&self, kind: &str) -> Arc<Informer> {
        if let Some(existing) = self.inner.informers.read().await.get(kind) {
            return Arc::clone(existing);
        }

        let mut informers = self.inner.informers.write().await;
        let informer = informers
            .entry(kind.to_string())
            .or_insert_with(|| {
                debug!(kind, "Creating informer");
                Informer::new(kind, Arc::clone(&self.inner.list_watch), self.inner.config.clone())
            })
            .clone();
        drop(informers);

        if let Some(token) = self.started_token() {
            informer.start(token);
        }
        informer
    }

    /// Start every informer created so far and any created later.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyStarted` on a second call.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        {
            let mut slot = self.inner.token.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(Error::already_started("informer cache"));
            }
            *slot = Some(token.clone());
        }

        let informers = self.inner.informers.read().await;
        info!(informers = informers.len(), "Starting informer cache");
        for informer in informers.values() {
            informer.start(token.clone());
        }
        Ok(())
    }

    /// Wait until every informer created so far has synced.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if `token` is cancelled first.
    pub async fn wait_for_sync(&self, token: &CancellationToken) -> Result<()> {
        let informers: Vec<Arc<Informer>> =
            self.inner.informers.read().await.values().cloned().collect();
        for informer in informers {
            informer.wait_for_sync(token).await?;
        }
        Ok(())
    }

    /// Kinds with an informer, sorted.
    pub async fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.inner.informers.read().await.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    async fn synced_informer(&self, kind: &str) -> Result<Arc<Informer>> {
        let token = self
            .started_token()
            .ok_or_else(|| Error::sync_failed(kind, "informer cache not started"))?;
        let informer = self.informer_for(kind).await;
        informer.wait_for_sync(&token).await?;
        Ok(informer)
    }

    /// Read one object from the cache.
    ///
    /// # Errors
    ///
    /// Fails if the cache has not been started or is stopped before the
    /// kind's informer syncs.
    pub async fn get(&self, kind: &str, key: &ReconcileKey) -> Result<Option<Object>> {
        Ok(self.synced_informer(kind).await?.get(key).await)
    }

    /// List every cached object of `kind`, sorted by key.
    ///
    /// # Errors
    ///
    /// Same as [`InformerCache::get`].
    pub async fn list(&self, kind: &str) -> Result<Vec<Object>> {
        Ok(self.synced_informer(kind).await?.list().await)
    }
}

impl std::fmt::Debug for InformerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InformerCache")
            .field("config", &self.inner.config)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}
