//! Core error types for ctrl operations.
//!
//! All errors are explicit and typed. Steady-state reconcile failures are
//! carried as values and retried; only startup failures reach the caller.

use thiserror::Error;

/// Core error type for ctrl operations.
#[derive(Debug, Error)]
pub enum Error {
    // Startup errors
    #[error("cache for kind '{kind}' failed to sync: {reason}")]
    SyncFailed { kind: String, reason: String },

    #[error("timed out after {timeout_ms}ms waiting for caches to sync")]
    SyncTimeout { timeout_ms: u64 },

    #[error("stop signal received")]
    Stopped,

    #[error("{component} already started")]
    AlreadyStarted { component: String },

    #[error("controller '{name}' is already registered")]
    ControllerExists { name: String },

    // Object store errors
    #[error("object '{key}' not found")]
    NotFound { key: String },

    #[error("object '{key}' already exists")]
    AlreadyExists { key: String },

    #[error("listing kind '{kind}' failed: {reason}")]
    ListFailed { kind: String, reason: String },

    // Reconcile errors
    #[error("reconcile of '{key}' failed: {reason}")]
    ReconcileFailed { key: String, reason: String },

    #[error("reconcile of '{key}' panicked: {message}")]
    ReconcilePanicked { key: String, message: String },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("configuration parse error: {reason}")]
    ConfigParseFailed { reason: String },

    #[error("invalid reconcile key '{input}': {reason}")]
    InvalidKey { input: String, reason: String },

    // Generic I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a sync failed error.
    pub fn sync_failed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SyncFailed {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create a sync timeout error.
    #[must_use]
    pub fn sync_timeout(timeout: std::time::Duration) -> Self {
        Self::SyncTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create an already started error.
    pub fn already_started(component: impl Into<String>) -> Self {
        Self::AlreadyStarted {
            component: component.into(),
        }
    }

    /// Create a controller exists error.
    pub fn controller_exists(name: impl Into<String>) -> Self {
        Self::ControllerExists { name: name.into() }
    }

    /// Create a not found error.
    pub fn not_found(key: impl ToString) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(key: impl ToString) -> Self {
        Self::AlreadyExists {
            key: key.to_string(),
        }
    }

    /// Create a list failed error.
    pub fn list_failed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ListFailed {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create a reconcile failed error.
    pub fn reconcile_failed(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::ReconcileFailed {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a reconcile panicked error.
    pub fn reconcile_panicked(key: impl ToString, message: impl Into<String>) -> Self {
        Self::ReconcilePanicked {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a config parse error.
    pub fn config_parse_failed(reason: impl Into<String>) -> Self {
        Self::ConfigParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid key error.
    pub fn invalid_key(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
