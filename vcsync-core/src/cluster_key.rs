//! Stable tenant identity and the super-cluster naming contract.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The canonical identity of one tenant cluster.
///
/// A cluster key is derived from the tenant descriptor as
/// `name-namespace-uid` and stays stable for the descriptor's lifetime. It is
/// used verbatim as the prefix of every super-cluster namespace owned by the
/// tenant, which is what makes name collisions across tenants impossible:
///
/// ```
/// use vcsync_core::ClusterKey;
/// let key = ClusterKey::new("test", "tenant-1", "7374a172-c35d-45b1-9c8e-bf5c5b614937");
/// assert_eq!(
///     key.super_namespace("default"),
///     "test-tenant-1-7374a172-c35d-45b1-9c8e-bf5c5b614937-default",
/// );
/// ```
///
/// Both the key and the derived namespace names are part of the external
/// contract: users inspect them on the super cluster.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterKey(String);

impl ClusterKey {
    /// Derive the key for a descriptor identified by `(name, namespace, uid)`.
    #[must_use]
    pub fn new(name: &str, namespace: &str, uid: &str) -> Self {
        Self(format!("{name}-{namespace}-{uid}"))
    }

    /// Wrap a key that was previously derived and stored (for example read
    /// back from a delegation annotation).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The super-cluster namespace that hosts projections of objects living
    /// in `tenant_namespace` inside this tenant.
    #[must_use]
    pub fn super_namespace(&self, tenant_namespace: &str) -> String {
        format!("{}-{tenant_namespace}", self.0)
    }

    /// The name of the tenant's root namespace on the super cluster.
    ///
    /// The root namespace is owned by the tenant as a whole rather than by
    /// any single tenant object, so its name is the bare cluster key.
    #[must_use]
    pub fn root_namespace(&self) -> &str {
        &self.0
    }

    /// Whether `super_namespace` is inside this tenant's slice of the super
    /// cluster, i.e. whether it is the root namespace or prefixed by the key.
    #[must_use]
    pub fn owns_namespace(&self, super_namespace: &str) -> bool {
        super_namespace == self.0
            || super_namespace
                .strip_prefix(self.0.as_str())
                .is_some_and(|rest| rest.starts_with('-'))
    }
}

impl Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClusterKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::ClusterKey;

    #[test]
    fn key_is_name_namespace_uid() {
        let key = ClusterKey::new("test", "tenant-1", "7374a172-c35d-45b1-9c8e-bf5c5b614937");
        assert_eq!(key.as_str(), "test-tenant-1-7374a172-c35d-45b1-9c8e-bf5c5b614937");
    }

    #[test]
    fn super_namespace_appends_tenant_namespace() {
        let key = ClusterKey::new("test", "tenant-1", "7374a172-c35d-45b1-9c8e-bf5c5b614937");
        assert_eq!(
            key.super_namespace("default"),
            "test-tenant-1-7374a172-c35d-45b1-9c8e-bf5c5b614937-default"
        );
    }

    #[test]
    fn namespace_containment() {
        let key = ClusterKey::new("vc", "ns", "uid-1");
        assert!(key.owns_namespace("vc-ns-uid-1-default"));
        assert!(key.owns_namespace("vc-ns-uid-1"));
        assert!(!key.owns_namespace("vc-ns-uid-10-default"));
        assert!(!key.owns_namespace("other-ns-uid-1-default"));
    }
}
