//! Demo controller: keep exactly one owned ReplicaSet per Deployment.
//!
//! The reconciler reads through the shared informer cache and writes to the
//! in-memory store. Child names are derived from the parent, so a create
//! that races a stale cache read fails with `AlreadyExists` and is treated
//! as converged.

use std::sync::Arc;

use async_trait::async_trait;
use ctrl_core::{Error, Object, OwnerReference, ReconcileKey, Result};
use ctrl_events::{
    EnqueueHandler, EnqueueOwnerHandler, InMemoryObjectStore, InformerCache, KindSource,
};
use ctrl_reconciler::{
    Controller, ControllerConfig, ControllerManager, ReconcileRequest, ReconcileResult, Reconciler,
};
use serde_json::json;
use tracing::{debug, info};

pub const DEPLOYMENT: &str = "Deployment";
pub const REPLICA_SET: &str = "ReplicaSet";
const API_VERSION: &str = "apps/v1";

/// Name of the ReplicaSet owned by `deployment`.
#[must_use]
pub fn replica_set_name(deployment: &str) -> String {
    format!("{deployment}-rs")
}

/// Desired replica count, defaulting to 1.
fn replicas(object: &Object) -> u64 {
    object
        .data
        .get("replicas")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(1)
}

/// A Deployment with the given replica count.
#[must_use]
pub fn deployment(namespace: &str, name: &str, replicas: u64) -> Object {
    Object::new(API_VERSION, DEPLOYMENT, namespace, name).with_data(json!({ "replicas": replicas }))
}

pub struct ReplicaSetReconciler {
    store: Arc<InMemoryObjectStore>,
    cache: InformerCache,
}

impl ReplicaSetReconciler {
    pub const fn new(store: Arc<InMemoryObjectStore>, cache: InformerCache) -> Self {
        Self { store, cache }
    }

    async fn owned_replica_sets(&self, key: &ReconcileKey) -> Result<Vec<Object>> {
        let all = self.cache.list(REPLICA_SET).await?;
        Ok(all
            .into_iter()
            .filter(|rs| rs.metadata.namespace == key.namespace())
            .filter(|rs| {
                rs.controller_owner()
                    .is_some_and(|owner| owner.kind == DEPLOYMENT && owner.name == key.name())
            })
            .collect())
    }

    async fn delete_ignoring_missing(&self, object: &Object) -> Result<()> {
        match self.store.delete(&object.kind, &object.key()).await {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Reconciler for ReplicaSetReconciler {
    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResult> {
        let key = request.key;
        let owned = self.owned_replica_sets(&key).await?;

        let Some(parent) = self.cache.get(DEPLOYMENT, &key).await? else {
            for orphan in &owned {
                info!(key = %key, replica_set = %orphan.key(), "Deleting orphaned ReplicaSet");
                self.delete_ignoring_missing(orphan).await?;
            }
            return Ok(ReconcileResult::done());
        };

        let wanted = replicas(&parent);
        let name = replica_set_name(key.name());
        let (current, extra): (Vec<Object>, Vec<Object>) = owned
            .into_iter()
            .partition(|rs| {
                rs.metadata.name == name
                    && rs
                        .controller_owner()
                        .is_some_and(|o| o.uid == parent.metadata.uid)
            });

        for stale in &extra {
            info!(key = %key, replica_set = %stale.key(), "Deleting stale ReplicaSet");
            self.delete_ignoring_missing(stale).await?;
        }

        match current.into_iter().next() {
            None => {
                let child = Object::new(API_VERSION, REPLICA_SET, key.namespace(), &name)
                    .with_data(json!({ "replicas": wanted }))
                    .with_owner(OwnerReference::controller_of(&parent));
                match self.store.create(child).await {
                    Ok(created) => info!(
                        key = %key,
                        replica_set = %created.key(),
                        replicas = wanted,
                        "Created ReplicaSet"
                    ),
                    Err(Error::AlreadyExists { .. }) => {
                        debug!(key = %key, "ReplicaSet already exists");
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(existing) if replicas(&existing) != wanted => {
                let scaled = existing.with_data(json!({ "replicas": wanted }));
                self.store.update(scaled).await?;
                info!(key = %key, replicas = wanted, "Scaled ReplicaSet");
            }
            Some(_) => debug!(key = %key, "ReplicaSet up to date"),
        }
        Ok(ReconcileResult::done())
    }
}

/// Register the demo controller: Deployments directly, ReplicaSets through
/// their owning Deployment.
///
/// # Errors
///
/// Fails if the configuration is invalid or the name is taken.
pub fn register(
    manager: &ControllerManager,
    store: Arc<InMemoryObjectStore>,
    config: ControllerConfig,
) -> Result<()> {
    let reconciler = ReplicaSetReconciler::new(store, manager.cache().clone());
    let controller =
        Controller::with_config("deployment-replicasets", Arc::new(reconciler), config)?;
    manager.add_controller(controller, |controller, cache| {
        controller.watch(KindSource::new(cache.clone(), DEPLOYMENT), EnqueueHandler)?;
        controller.watch(
            KindSource::new(cache.clone(), REPLICA_SET),
            EnqueueOwnerHandler::new(DEPLOYMENT).controller_only(),
        )
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_replicas_default_to_one() {
        let bare = Object::new(API_VERSION, DEPLOYMENT, "default", "web");
        assert_eq!(replicas(&bare), 1);
        assert_eq!(replicas(&deployment("default", "web", 3)), 3);
    }

    #[test]
    fn test_replica_set_name() {
        assert_eq!(replica_set_name("web"), "web-rs");
    }
}
