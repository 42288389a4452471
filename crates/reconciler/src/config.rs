//! Controller and manager configuration.
//!
//! Every field has a serde default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! sync_timeout_ms = 30000
//! shutdown_timeout_ms = 30000
//!
//! [cache]
//! resync_period_ms = 600000
//!
//! [controller]
//! max_concurrent_reconciles = 4
//!
//! [controller.rate_limiter]
//! base_delay_ms = 5
//! max_delay_ms = 1000000
//! ```

use std::path::Path;
use std::time::Duration;

use ctrl_core::{Error, Result};
use ctrl_events::CacheConfig;
use ctrl_workqueue::RateLimiterConfig;
use serde::{Deserialize, Serialize};

fn default_max_concurrent_reconciles() -> usize {
    1
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Per-controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of worker tasks.
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,

    /// Retry backoff for failed reconciles.
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    /// Upper bound on waiting for sources to sync in standalone mode.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Upper bound on draining workers in standalone mode.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: default_max_concurrent_reconciles(),
            rate_limiter: RateLimiterConfig::default(),
            sync_timeout_ms: default_sync_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub const fn with_max_concurrent_reconciles(mut self, workers: usize) -> Self {
        self.max_concurrent_reconciles = workers;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiterConfig) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    #[must_use]
    pub const fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for zero workers, zero timeouts or an
    /// invalid rate limiter.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::invalid_config(
                "max_concurrent_reconciles must be greater than 0",
            ));
        }
        if self.sync_timeout_ms == 0 {
            return Err(Error::invalid_config("sync_timeout_ms must be greater than 0"));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(Error::invalid_config(
                "shutdown_timeout_ms must be greater than 0",
            ));
        }
        self.rate_limiter.validate()
    }
}

/// Manager-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Upper bound on cache and source sync during start.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Upper bound on draining every worker after cancellation.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Defaults for controllers built from this configuration.
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: default_sync_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            cache: CacheConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controller = controller;
        self
    }

    #[must_use]
    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if any section is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.sync_timeout_ms == 0 {
            return Err(Error::invalid_config("sync_timeout_ms must be greater than 0"));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(Error::invalid_config(
                "shutdown_timeout_ms must be greater than 0",
            ));
        }
        self.cache.validate()?;
        self.controller.validate()
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// `Error::ConfigParseFailed` for malformed TOML, `Error::InvalidConfig`
    /// for values that fail validation.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| Error::config_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the file cannot be read, otherwise as
    /// [`ManagerConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }
}
