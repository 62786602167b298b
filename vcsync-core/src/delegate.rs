//! Delegation annotations: the ownership contract stamped on managed
//! super-cluster objects.
//!
//! Every physical object the syncer manages carries three annotations that
//! identify exactly one virtual object, and the syncer rediscovers ownership
//! from them on every pass. No back-pointers are stored anywhere else.

use crate::cluster_key::ClusterKey;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// The annotation/label group owned by the syncer.
pub const GROUP: &str = "tenancy.vcsync.dev";

/// Annotation carrying the owning tenant's cluster key.
pub const CLUSTER: &str = "tenancy.vcsync.dev/cluster";

/// Annotation carrying the tenant-side namespace of the virtual object.
pub const NAMESPACE: &str = "tenancy.vcsync.dev/namespace";

/// Annotation carrying the UID of the virtual object.
pub const UID: &str = "tenancy.vcsync.dev/uid";

/// Annotation marking a tenant's root namespace on the super cluster.
pub const ROOT_NS: &str = "tenancy.vcsync.dev/rootNS";

/// Label marking a super-cluster object that is mirrored into every tenant.
pub const PUBLIC: &str = "tenancy.vcsync.dev/public";

/// The parsed delegation annotations of a physical object.
///
/// A `Delegate` identifies the single virtual object a physical object is a
/// projection of. UID fidelity is enforced against [`Delegate::uid`] before
/// every write: a mismatch means the physical object is an orphan left over
/// from an earlier incarnation of the name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delegate {
    /// Key of the owning tenant cluster.
    pub cluster: ClusterKey,
    /// Namespace of the virtual object inside the tenant. Empty for objects
    /// owned by the tenant as a whole (the root namespace).
    pub namespace: String,
    /// UID of the virtual object (or of the tenant descriptor for root
    /// namespaces).
    pub uid: String,
}

impl Delegate {
    /// Read the delegation annotations off `meta`.
    ///
    /// Returns `None` when any of the three keys is missing, which means the
    /// object is not managed by the syncer.
    #[must_use]
    pub fn of(meta: &ObjectMeta) -> Option<Self> {
        let annotations = meta.annotations.as_ref()?;
        Some(Self {
            cluster: ClusterKey::from_raw(annotations.get(CLUSTER)?.clone()),
            namespace: annotations.get(NAMESPACE)?.clone(),
            uid: annotations.get(UID)?.clone(),
        })
    }

    /// Stamp the delegation annotations onto `meta`, overwriting any previous
    /// values.
    pub fn stamp(&self, meta: &mut ObjectMeta) {
        let annotations = meta.annotations.get_or_insert_with(Default::default);
        annotations.insert(CLUSTER.to_string(), self.cluster.as_str().to_string());
        annotations.insert(NAMESPACE.to_string(), self.namespace.clone());
        annotations.insert(UID.to_string(), self.uid.clone());
    }

    /// The super-cluster namespace the delegated object is expected to live
    /// in, or the root namespace when the tenant namespace is empty.
    #[must_use]
    pub fn super_namespace(&self) -> String {
        if self.namespace.is_empty() {
            self.cluster.root_namespace().to_string()
        } else {
            self.cluster.super_namespace(&self.namespace)
        }
    }
}

/// Whether `meta` carries the root-namespace marker.
#[must_use]
pub fn is_root_ns(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ROOT_NS))
        .is_some_and(|v| v == "true")
}

/// Whether `meta` carries the public label.
#[must_use]
pub fn is_public(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(PUBLIC))
        .is_some_and(|v| v == "true")
}
