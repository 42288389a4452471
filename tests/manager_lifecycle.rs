//! Integration tests for controller manager lifecycle.
//!
//! These tests verify that:
//! - A source that never syncs fails start without running any worker
//! - Cancellation drains in-flight reconciles and aborts stragglers
//! - Reconciler panics and errors are retried with backoff
//! - Configuration loads from a TOML file

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use ctrl::ctrl_events::WatchEvent;
use ctrl::prelude::*;

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

/// List-watch whose listing always fails.
struct UnreachableListWatch;

#[async_trait]
impl ListWatch for UnreachableListWatch {
    async fn list(&self, kind: &str) -> ctrl::ctrl_core::Result<Vec<Object>> {
        Err(Error::list_failed(kind, "connection refused"))
    }

    async fn watch(&self, _kind: &str) -> ctrl::ctrl_core::Result<broadcast::Receiver<WatchEvent>> {
        Ok(broadcast::channel(1).1)
    }
}

fn fast_config() -> ManagerConfig {
    ManagerConfig::default()
        .with_sync_timeout(Duration::from_millis(300))
        .with_shutdown_timeout(Duration::from_secs(5))
}

/// Single-key controller fed through a channel source.
fn channel_controller(
    manager: &ControllerManager,
    name: &str,
    reconciler: Arc<dyn Reconciler>,
    config: ControllerConfig,
) -> std::result::Result<mpsc::Sender<Event>, Box<dyn std::error::Error>> {
    let (tx, source) = ChannelSource::channel(16);
    let controller = Controller::with_config(name, reconciler, config)?;
    manager.add_controller(controller, move |controller, _cache| {
        controller.watch(source, EnqueueHandler)
    })?;
    Ok(tx)
}

fn poke(name: &str) -> Event {
    Event::added(Object::new("v1", "ConfigMap", "default", name))
}

/// A source that never syncs fails start.
///
/// # GIVEN
/// A controller watching a kind whose listing always fails
///
/// # WHEN
/// The manager starts with a short sync timeout
///
/// # THEN
/// Start returns `SyncTimeout` and the reconciler never runs
#[tokio::test]
async fn test_sync_failure_is_fail_fast() -> TestResult {
    let calls = Arc::new(AtomicU32::new(0));
    let reconciler = {
        let calls = Arc::clone(&calls);
        ReconcileFn::new(move |_: ReconcileRequest| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(ReconcileResult::done()) }
        })
    };
    let manager = ControllerManager::new(Arc::new(UnreachableListWatch), fast_config())?;
    manager.add_controller(
        Controller::new("deployments", Arc::new(reconciler)),
        |controller, cache| {
            controller.watch(KindSource::new(cache.clone(), "Deployment"), EnqueueHandler)
        },
    )?;

    let result = timeout(Duration::from_secs(5), manager.start(CancellationToken::new()))
        .await
        .map_err(|_| "start did not fail in time")?;

    assert!(matches!(result, Err(Error::SyncTimeout { .. })), "got {result:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

/// A pre-registered kind that never syncs fails at the cache step.
///
/// # GIVEN
/// An informer requested from the cache before start
///
/// # WHEN
/// The manager starts
///
/// # THEN
/// Start fails before any deferred init runs
#[tokio::test]
async fn test_cache_sync_failure_skips_deferred_init() -> TestResult {
    let manager = ControllerManager::new(Arc::new(UnreachableListWatch), fast_config())?;
    manager.cache().informer_for("Deployment").await;

    let init_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&init_ran);
    let reconciler = ReconcileFn::new(|_: ReconcileRequest| async { Ok(ReconcileResult::done()) });
    manager.add_controller(
        Controller::new("deployments", Arc::new(reconciler)),
        move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        },
    )?;

    let result = manager.start(CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::SyncTimeout { .. })));
    assert!(!init_ran.load(Ordering::SeqCst));
    Ok(())
}

/// Cancellation lets in-flight reconciles finish.
///
/// # GIVEN
/// A reconcile in progress
///
/// # WHEN
/// The token is cancelled
///
/// # THEN
/// Start returns Ok only after the reconcile completed
#[tokio::test]
async fn test_shutdown_drains_in_flight_reconcile() -> TestResult {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicBool::new(false));
    let reconciler = {
        let finished = Arc::clone(&finished);
        ReconcileFn::new(move |request: ReconcileRequest| {
            let started_tx = started_tx.clone();
            let finished = Arc::clone(&finished);
            async move {
                let _ = started_tx.send(request.key);
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(ReconcileResult::done())
            }
        })
    };

    let manager = Arc::new(ControllerManager::new(InMemoryObjectStore::new_arc(), fast_config())?);
    let tx = channel_controller(
        &manager,
        "slow",
        Arc::new(reconciler),
        ControllerConfig::default(),
    )?;

    let token = CancellationToken::new();
    let running = {
        let manager = Arc::clone(&manager);
        let token = token.clone();
        tokio::spawn(async move { manager.start(token).await })
    };

    tx.send(poke("settings")).await?;
    timeout(Duration::from_secs(2), started_rx.recv())
        .await
        .map_err(|_| "reconcile never started")?;

    token.cancel();
    running.await??;
    assert!(finished.load(Ordering::SeqCst), "in-flight reconcile was cut short");
    Ok(())
}

/// Workers that outlive the shutdown timeout are aborted.
///
/// # GIVEN
/// A reconcile that takes far longer than the shutdown timeout
///
/// # WHEN
/// The token is cancelled
///
/// # THEN
/// Start still returns Ok promptly
#[tokio::test]
async fn test_shutdown_timeout_aborts_stragglers() -> TestResult {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let reconciler = ReconcileFn::new(move |request: ReconcileRequest| {
        let started_tx = started_tx.clone();
        async move {
            let _ = started_tx.send(request.key);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ReconcileResult::done())
        }
    });

    let config = fast_config().with_shutdown_timeout(Duration::from_millis(100));
    let manager = Arc::new(ControllerManager::new(InMemoryObjectStore::new_arc(), config)?);
    let tx = channel_controller(
        &manager,
        "stuck",
        Arc::new(reconciler),
        ControllerConfig::default(),
    )?;

    let token = CancellationToken::new();
    let running = {
        let manager = Arc::clone(&manager);
        let token = token.clone();
        tokio::spawn(async move { manager.start(token).await })
    };

    tx.send(poke("settings")).await?;
    timeout(Duration::from_secs(2), started_rx.recv())
        .await
        .map_err(|_| "reconcile never started")?;

    let cancelled_at = Instant::now();
    token.cancel();
    timeout(Duration::from_secs(2), running)
        .await
        .map_err(|_| "manager did not stop")???;
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    Ok(())
}

/// A panicking reconcile is contained and retried.
///
/// # GIVEN
/// A reconciler that panics on its first call
///
/// # WHEN
/// A key is enqueued
///
/// # THEN
/// The worker survives and the key is reconciled again
#[tokio::test]
#[allow(clippy::panic)]
async fn test_panic_recovery() -> TestResult {
    let attempts = Arc::new(AtomicU32::new(0));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let reconciler = {
        let attempts = Arc::clone(&attempts);
        ReconcileFn::new(move |request: ReconcileRequest| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let done_tx = done_tx.clone();
            async move {
                if attempt == 1 {
                    panic!("reconciler exploded");
                }
                let _ = done_tx.send(request.key);
                Ok(ReconcileResult::done())
            }
        })
    };

    let manager = Arc::new(ControllerManager::new(InMemoryObjectStore::new_arc(), fast_config())?);
    let tx = channel_controller(
        &manager,
        "panicky",
        Arc::new(reconciler),
        ControllerConfig::default(),
    )?;
    let token = CancellationToken::new();
    let running = {
        let manager = Arc::clone(&manager);
        let token = token.clone();
        tokio::spawn(async move { manager.start(token).await })
    };

    tx.send(poke("settings")).await?;
    let key = timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .map_err(|_| "key was not retried after panic")?
        .ok_or("channel closed")?;
    assert_eq!(key, ReconcileKey::new("default", "settings"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    token.cancel();
    running.await??;
    Ok(())
}

/// Failing reconciles back off exponentially.
///
/// # GIVEN
/// A reconciler that always fails, with a 50ms base delay
///
/// # WHEN
/// A key is enqueued
///
/// # THEN
/// The first three retries are spaced by at least 50ms, 100ms and 200ms
#[tokio::test]
async fn test_error_retry_with_backoff() -> TestResult {
    let (attempt_tx, mut attempt_rx) = mpsc::unbounded_channel();
    let reconciler = ReconcileFn::new(move |request: ReconcileRequest| {
        let attempt_tx = attempt_tx.clone();
        async move {
            let _ = attempt_tx.send(Instant::now());
            Err::<ReconcileResult, _>(Error::reconcile_failed(&request.key, "not yet"))
        }
    });

    let rate_limiter = RateLimiterConfig::default()
        .with_base_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(10));
    let config = ControllerConfig::default().with_rate_limiter(rate_limiter);

    let manager = Arc::new(ControllerManager::new(InMemoryObjectStore::new_arc(), fast_config())?);
    let tx = channel_controller(&manager, "flaky", Arc::new(reconciler), config)?;
    let token = CancellationToken::new();
    let running = {
        let manager = Arc::clone(&manager);
        let token = token.clone();
        tokio::spawn(async move { manager.start(token).await })
    };

    tx.send(poke("settings")).await?;
    let mut attempts = Vec::new();
    for _ in 0..4 {
        let at = timeout(Duration::from_secs(3), attempt_rx.recv())
            .await
            .map_err(|_| "retry did not happen")?
            .ok_or("channel closed")?;
        attempts.push(at);
    }

    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, minimum) in gaps.iter().zip([50u64, 100, 200]) {
        assert!(*gap >= Duration::from_millis(minimum), "gap {gap:?} < {minimum}ms");
    }

    token.cancel();
    running.await??;
    Ok(())
}

/// Configuration file drives the manager.
///
/// # GIVEN
/// A TOML file with custom timeouts and worker count
///
/// # WHEN
/// It is loaded and used to build a manager
///
/// # THEN
/// The values are applied; an invalid file is rejected
#[test]
fn test_config_file_round_trip() -> TestResult {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        r"
sync_timeout_ms = 2000
shutdown_timeout_ms = 1000

[controller]
max_concurrent_reconciles = 3
"
    )?;

    let config = ManagerConfig::from_file(file.path())?;
    assert_eq!(config.sync_timeout(), Duration::from_secs(2));
    assert_eq!(config.controller.max_concurrent_reconciles, 3);

    let manager = ControllerManager::new(InMemoryObjectStore::new_arc(), config)?;
    assert_eq!(manager.config().shutdown_timeout(), Duration::from_secs(1));

    let mut invalid = tempfile::NamedTempFile::new()?;
    writeln!(invalid, "shutdown_timeout_ms = 0")?;
    assert!(matches!(
        ManagerConfig::from_file(invalid.path()),
        Err(Error::InvalidConfig { .. })
    ));
    Ok(())
}
