//! Dynamic object model.
//!
//! Objects carry just enough metadata for key derivation, owner routing and
//! change detection. The payload is opaque JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::ReconcileKey;

/// A recorded relation from a dependent object to an object that manages it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    /// API version of the owner, e.g. `apps/v1`.
    pub api_version: String,
    /// Kind of the owner, e.g. `Deployment`.
    pub kind: String,
    /// Name of the owner, in the dependent's namespace.
    pub name: String,
    /// UID of the owner.
    pub uid: String,
    /// Whether the owner is the managing controller.
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Create a non-controller owner reference.
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            uid: uid.into(),
            controller: false,
        }
    }

    /// Create a controller owner reference pointing at `owner`.
    #[must_use]
    pub fn controller_of(owner: &Object) -> Self {
        Self {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.metadata.name.clone(),
            uid: owner.metadata.uid.clone(),
            controller: true,
        }
    }

    /// Mark as (non-)controller.
    #[must_use]
    pub const fn with_controller(mut self, controller: bool) -> Self {
        self.controller = controller;
        self
    }

    /// API group of the owner (empty for the core group).
    #[must_use]
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map_or("", |(group, _)| group)
    }
}

/// Object metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Namespace, empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,
    /// Name, unique within namespace and kind.
    pub name: String,
    /// Store-assigned unique id.
    #[serde(default)]
    pub uid: String,
    /// Store-assigned version, increases on every write.
    #[serde(default)]
    pub resource_version: u64,
    /// Increases when the payload changes.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// A dynamically typed object as seen by the upstream stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Object {
    /// Create an empty object of the given kind.
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ObjectMeta {
                namespace: namespace.into(),
                name: name.into(),
                ..ObjectMeta::default()
            },
            data: serde_json::Value::Null,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Add an owner reference.
    #[must_use]
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.metadata.owner_references.push(owner);
        self
    }

    /// Reconcile key of this object.
    #[must_use]
    pub fn key(&self) -> ReconcileKey {
        ReconcileKey::new(self.metadata.namespace.clone(), self.metadata.name.clone())
    }

    /// The owner reference flagged as controller, if any.
    #[must_use]
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.metadata.owner_references.iter().find(|o| o.controller)
    }

    /// Owner references of the given kind.
    pub fn owners_of_kind<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = &'a OwnerReference> + 'a {
        self.metadata
            .owner_references
            .iter()
            .filter(move |o| o.kind == kind)
    }

    /// Whether the object's labels contain every `(key, value)` pair.
    #[must_use]
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.metadata.labels.get(k) == Some(v))
    }
}
