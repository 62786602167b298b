//! Reverse index from super-cluster namespaces to their owning tenants.
//!
//! Super namespace names embed the cluster key, but they are never parsed:
//! ownership is rediscovered from the delegation annotations on the
//! namespace object itself. Kinds whose objects carry no delegation
//! annotations of their own (events emitted by super-side controllers) use
//! this index to translate a super namespace back to
//! `(cluster, tenant namespace)`.

use k8s_openapi::api::core::v1::Namespace;
use parking_lot::RwLock;
use std::collections::HashMap;
use vcsync_core::Delegate;

/// Shared index over the delegation annotations of super namespaces.
///
/// Fed by the namespace syncer's super-side informer; read by every syncer.
#[derive(Default)]
pub struct SuperNamespaceIndex {
    entries: RwLock<HashMap<String, Delegate>>,
}

impl SuperNamespaceIndex {
    /// An empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) what `namespace` delegates to. Namespaces without
    /// delegation annotations are not tenant-owned and are dropped from the
    /// index.
    pub fn observe(&self, namespace: &Namespace) {
        let Some(name) = namespace.metadata.name.clone() else { return };
        match Delegate::of(&namespace.metadata) {
            Some(delegate) => {
                self.entries.write().insert(name, delegate);
            }
            None => {
                self.entries.write().remove(&name);
            }
        }
    }

    /// Drop `namespace` from the index.
    pub fn forget(&self, namespace: &str) {
        self.entries.write().remove(namespace);
    }

    /// Resolve a super namespace to the tenant coordinates it projects.
    #[must_use]
    pub fn resolve(&self, super_namespace: &str) -> Option<Delegate> {
        self.entries.read().get(super_namespace).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use vcsync_core::ClusterKey;

    fn super_namespace(name: &str, delegate: Option<&Delegate>) -> Namespace {
        let mut meta = ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        };
        if let Some(delegate) = delegate {
            delegate.stamp(&mut meta);
        }
        Namespace {
            metadata: meta,
            ..Namespace::default()
        }
    }

    #[test]
    fn resolves_observed_namespaces() {
        let index = SuperNamespaceIndex::new();
        let delegate = Delegate {
            cluster: ClusterKey::new("vc", "t1", "u1"),
            namespace: "default".to_string(),
            uid: "ns-uid".to_string(),
        };
        index.observe(&super_namespace("vc-t1-u1-default", Some(&delegate)));
        assert_eq!(index.resolve("vc-t1-u1-default"), Some(delegate));
        assert_eq!(index.resolve("unknown"), None);
    }

    #[test]
    fn unmanaged_namespaces_are_evicted() {
        let index = SuperNamespaceIndex::new();
        let delegate = Delegate {
            cluster: ClusterKey::new("vc", "t1", "u1"),
            namespace: "default".to_string(),
            uid: "ns-uid".to_string(),
        };
        index.observe(&super_namespace("ns", Some(&delegate)));
        index.observe(&super_namespace("ns", None));
        assert_eq!(index.resolve("ns"), None);
    }
}
