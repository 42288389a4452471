//! The reconcile contract.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ctrl_core::{ReconcileKey, Result};
use serde::{Deserialize, Serialize};

/// Ask to reconcile one object, identified by key only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub key: ReconcileKey,
}

impl ReconcileRequest {
    #[must_use]
    pub const fn new(key: ReconcileKey) -> Self {
        Self { key }
    }
}

impl std::fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// What the worker does with a key after a successful reconcile.
///
/// `requeue_after` takes precedence over `requeue`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Converged; nothing more to do until the next event.
    #[must_use]
    pub const fn done() -> Self {
        Self {
            requeue: false,
            requeue_after: None,
        }
    }

    /// Reconcile again as soon as possible.
    #[must_use]
    pub const fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Reconcile again after `delay`.
    #[must_use]
    pub const fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: true,
            requeue_after: Some(delay),
        }
    }
}

/// User-supplied convergence logic.
///
/// Implementations must be idempotent: the same key may be reconciled any
/// number of times, and the object behind it may no longer exist.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResult>;
}

/// Adapts an async closure into a [`Reconciler`].
pub struct ReconcileFn<F> {
    f: F,
}

impl<F, Fut> ReconcileFn<F>
where
    F: Fn(ReconcileRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ReconcileResult>> + Send,
{
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Reconciler for ReconcileFn<F>
where
    F: Fn(ReconcileRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ReconcileResult>> + Send,
{
    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResult> {
        (self.f)(request).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ctrl_core::Error;

    #[test]
    fn test_result_constructors() {
        assert_eq!(ReconcileResult::default(), ReconcileResult::done());
        assert!(ReconcileResult::requeue().requeue);
        assert_eq!(
            ReconcileResult::requeue_after(Duration::from_secs(5)).requeue_after,
            Some(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_reconcile_fn_forwards_request() {
        let reconciler = ReconcileFn::new(|request: ReconcileRequest| async move {
            if request.key.name() == "broken" {
                Err(Error::reconcile_failed(&request.key, "boom"))
            } else {
                Ok(ReconcileResult::done())
            }
        });

        let ok = reconciler
            .reconcile(ReconcileRequest::new(ReconcileKey::new("default", "web")))
            .await;
        assert!(ok.is_ok());

        let failed = reconciler
            .reconcile(ReconcileRequest::new(ReconcileKey::new("default", "broken")))
            .await;
        assert!(matches!(failed, Err(Error::ReconcileFailed { .. })));
    }
}
