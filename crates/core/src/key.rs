//! Reconcile keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Identity of one unit of reconciliation: a namespace and a name.
///
/// The external encoding is `"<namespace>/<name>"`. Cluster-scoped objects
/// have an empty namespace and encode as `"/<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconcileKey {
    namespace: String,
    name: String,
}

/// Kubernetes-flavoured alias.
pub type NamespacedName = ReconcileKey;

impl ReconcileKey {
    /// Create a namespaced key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a key for a cluster-scoped object.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }

    /// Namespace, empty for cluster-scoped objects.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Object name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the key has no namespace.
    #[must_use]
    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ReconcileKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, name) = s.split_once('/').unwrap_or(("", s));

        if name.is_empty() {
            return Err(Error::invalid_key(s, "name must not be empty"));
        }
        if name.contains('/') {
            return Err(Error::invalid_key(s, "expected at most one '/'"));
        }

        Ok(Self::new(namespace, name))
    }
}
