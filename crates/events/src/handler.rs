//! Event handlers: map change events to reconcile keys.

use std::collections::BTreeSet;

use ctrl_core::{Object, ReconcileKey};

use crate::event::{Event, EventType};

/// Maps an event to the keys that must be reconciled.
///
/// Returned keys are deduplicated and sorted.
pub trait EventHandler: Send + Sync {
    fn map(&self, event: &Event) -> Vec<ReconcileKey>;
}

/// Enqueues the key of the event's own object.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueHandler;

impl EventHandler for EnqueueHandler {
    fn map(&self, event: &Event) -> Vec<ReconcileKey> {
        vec![event.key()]
    }
}

/// Enqueues the owners of the event's object that match a kind.
///
/// Owners are resolved by identifier only: the key is built from the
/// dependent's namespace and the owner's name.
#[derive(Debug, Clone)]
pub struct EnqueueOwnerHandler {
    owner_kind: String,
    owner_group: Option<String>,
    controller_only: bool,
}

impl EnqueueOwnerHandler {
    pub fn new(owner_kind: impl Into<String>) -> Self {
        Self {
            owner_kind: owner_kind.into(),
            owner_group: None,
            controller_only: false,
        }
    }

    /// Only follow owner references in this API group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.owner_group = Some(group.into());
        self
    }

    /// Only follow the controlling owner reference.
    #[must_use]
    pub const fn controller_only(mut self) -> Self {
        self.controller_only = true;
        self
    }

    fn owner_keys(&self, object: &Object, keys: &mut BTreeSet<ReconcileKey>) {
        let namespace = &object.metadata.namespace;
        keys.extend(
            object
                .owners_of_kind(&self.owner_kind)
                .filter(|owner| !self.controller_only || owner.controller)
                .filter(|owner| {
                    self.owner_group
                        .as_deref()
                        .is_none_or(|group| owner.group() == group)
                })
                .map(|owner| ReconcileKey::new(namespace.clone(), owner.name.clone())),
        );
    }
}

impl EventHandler for EnqueueOwnerHandler {
    fn map(&self, event: &Event) -> Vec<ReconcileKey> {
        let mut keys = BTreeSet::new();
        match event.event_type {
            EventType::Added => self.owner_keys(&event.object, &mut keys),
            EventType::Updated => {
                if let Some(previous) = &event.previous_object {
                    self.owner_keys(previous, &mut keys);
                }
                self.owner_keys(&event.object, &mut keys);
            }
            EventType::Deleted => {
                let last_known = event.previous_object.as_ref().unwrap_or(&event.object);
                self.owner_keys(last_known, &mut keys);
            }
        }
        keys.into_iter().collect()
    }
}

/// Enqueues whatever keys a user function returns.
pub struct EnqueueMappedHandler<F> {
    mapper: F,
}

impl<F> EnqueueMappedHandler<F>
where
    F: Fn(&Event) -> Vec<ReconcileKey> + Send + Sync,
{
    pub const fn new(mapper: F) -> Self {
        Self { mapper }
    }
}

impl<F> EventHandler for EnqueueMappedHandler<F>
where
    F: Fn(&Event) -> Vec<ReconcileKey> + Send + Sync,
{
    fn map(&self, event: &Event) -> Vec<ReconcileKey> {
        let keys: BTreeSet<ReconcileKey> = (self.mapper)(event).into_iter().collect();
        keys.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctrl_core::OwnerReference;

    fn deployment(name: &str) -> Object {
        let mut object = Object::new("apps/v1", "Deployment", "default", name);
        object.metadata.uid = format!("uid-{name}");
        object
    }

    fn replica_set(name: &str, owner: &Object) -> Object {
        Object::new("apps/v1", "ReplicaSet", "default", name)
            .with_owner(OwnerReference::controller_of(owner))
    }

    #[test]
    fn test_enqueue_handler_maps_own_key() {
        let event = Event::added(deployment("web"));
        assert_eq!(
            EnqueueHandler.map(&event),
            vec![ReconcileKey::new("default", "web")]
        );
    }

    #[test]
    fn test_owner_handler_maps_to_owner() {
        let owner = deployment("web");
        let event = Event::added(replica_set("web-1", &owner));
        let keys = EnqueueOwnerHandler::new("Deployment").map(&event);
        assert_eq!(keys, vec![ReconcileKey::new("default", "web")]);
    }

    #[test]
    fn test_owner_handler_ignores_other_kinds() {
        let owner = deployment("web");
        let event = Event::added(replica_set("web-1", &owner));
        assert!(EnqueueOwnerHandler::new("StatefulSet").map(&event).is_empty());
    }

    #[test]
    fn test_owner_handler_update_covers_old_and_new_owner() {
        let old = replica_set("rs", &deployment("a"));
        let mut new = old.clone();
        new.metadata.owner_references = vec![OwnerReference::controller_of(&deployment("b"))];

        let keys = EnqueueOwnerHandler::new("Deployment").map(&Event::updated(old, new));
        assert_eq!(
            keys,
            vec![
                ReconcileKey::new("default", "a"),
                ReconcileKey::new("default", "b")
            ]
        );
    }

    #[test]
    fn test_owner_handler_delete_uses_last_known_state() {
        let last_known = replica_set("rs", &deployment("web"));
        let mut tombstone = last_known.clone();
        tombstone.metadata.owner_references.clear();

        let keys = EnqueueOwnerHandler::new("Deployment")
            .map(&Event::deleted(tombstone, Some(last_known)));
        assert_eq!(keys, vec![ReconcileKey::new("default", "web")]);
    }

    #[test]
    fn test_owner_handler_filters() {
        let owner = deployment("web");
        let loose = Object::new("apps/v1", "ReplicaSet", "default", "rs")
            .with_owner(OwnerReference::controller_of(&owner).with_controller(false));
        let event = Event::added(loose);

        assert!(
            EnqueueOwnerHandler::new("Deployment")
                .controller_only()
                .map(&event)
                .is_empty()
        );
        assert_eq!(
            EnqueueOwnerHandler::new("Deployment")
                .with_group("apps")
                .map(&event)
                .len(),
            1
        );
        assert!(
            EnqueueOwnerHandler::new("Deployment")
                .with_group("batch")
                .map(&event)
                .is_empty()
        );
    }

    #[test]
    fn test_mapped_handler_dedups() {
        let handler = EnqueueMappedHandler::new(|_: &Event| {
            vec![
                ReconcileKey::new("default", "b"),
                ReconcileKey::new("default", "a"),
                ReconcileKey::new("default", "b"),
            ]
        });
        let keys = handler.map(&Event::added(deployment("x")));
        assert_eq!(
            keys,
            vec![
                ReconcileKey::new("default", "a"),
                ReconcileKey::new("default", "b")
            ]
        );
    }
}
