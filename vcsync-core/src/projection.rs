//! Builds the physical (super-cluster) rendition of a virtual object.
//!
//! Projection owns the downward half of the mapping rules: which metadata
//! survives the trip from tenant to super, where the physical object lives,
//! and which delegation annotations it carries. The reverse direction never
//! parses names; ownership is always rediscovered from the annotations.

use crate::{cluster_key::ClusterKey, delegate::Delegate};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

/// Errors building a projection.
#[derive(Debug, Error)]
pub enum Error {
    /// The virtual object has no name (it was never persisted).
    #[error("virtual object has no name")]
    MissingName,
    /// The virtual object has no uid.
    #[error("virtual object {0} has no uid")]
    MissingUid(String),
    /// The virtual object has no namespace but the kind is namespaced.
    #[error("virtual object {0} has no namespace")]
    MissingNamespace(String),
}

/// Where a physical object lives on the super cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    /// Super-cluster namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Super-cluster object name.
    pub name: String,
}

impl Location {
    /// The standard location for a namespaced kind: same name, inside the
    /// tenant's prefixed super namespace.
    #[must_use]
    pub fn namespaced(key: &ClusterKey, tenant_namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(key.super_namespace(tenant_namespace)),
            name: name.to_string(),
        }
    }

    /// The location of the projection of a tenant namespace itself: a
    /// cluster-scoped object whose name is the prefixed super namespace.
    #[must_use]
    pub fn cluster_scoped(key: &ClusterKey, tenant_namespace: &str) -> Self {
        Self {
            namespace: None,
            name: key.super_namespace(tenant_namespace),
        }
    }
}

/// Derive the delegation record for a virtual object.
///
/// `tenant_namespace` is the namespace of the object inside the tenant; for
/// the `Namespace` kind it is the namespace's own name. It must not be
/// empty: only the tenant's root namespace delegates with an empty
/// namespace, and that record is built by the lifecycle manager, never
/// from a virtual object.
pub fn delegate_for(
    key: &ClusterKey,
    tenant_namespace: &str,
    v_meta: &ObjectMeta,
) -> Result<Delegate, Error> {
    let name = v_meta.name.clone().ok_or(Error::MissingName)?;
    if tenant_namespace.is_empty() {
        return Err(Error::MissingNamespace(name));
    }
    let uid = v_meta.uid.clone().ok_or(Error::MissingUid(name))?;
    Ok(Delegate {
        cluster: key.clone(),
        namespace: tenant_namespace.to_string(),
        uid,
    })
}

/// Build the metadata of a physical object from its virtual counterpart.
///
/// The returned metadata is a deep copy of `v_meta` with every
/// server-populated or tenant-local field cleared, the delegation
/// annotations stamped, and name/namespace replaced by `location`. Owner
/// references and finalizers never survive projection; adapters that need
/// either re-add them afterwards.
#[must_use]
pub fn projected_meta(v_meta: &ObjectMeta, delegate: &Delegate, location: Location) -> ObjectMeta {
    let mut meta = ObjectMeta {
        name: Some(location.name),
        namespace: location.namespace,
        labels: v_meta.labels.clone(),
        annotations: v_meta.annotations.clone(),
        ..ObjectMeta::default()
    };
    delegate.stamp(&mut meta);
    meta
}
