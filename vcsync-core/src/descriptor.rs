//! The `VirtualCluster` tenant descriptor resource.
//!
//! A descriptor is created externally (by the provisioning controller) and
//! only observed here. The syncer derives the tenant's [`ClusterKey`] from
//! it, builds a tenant API client out of the referenced admin kubeconfig
//! secret, and records attach failures and readiness on its status.

use crate::cluster_key::ClusterKey;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the tenant API server is exposed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ServiceType {
    /// Exposed through a node port.
    NodePort,
    /// Exposed through a cloud load balancer.
    LoadBalancer,
    /// Reachable only inside the super cluster.
    #[default]
    ClusterIP,
}

/// Spec of the `VirtualCluster` descriptor.
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tenancy.vcsync.dev",
    version = "v1alpha1",
    kind = "VirtualCluster",
    namespaced,
    status = "VirtualClusterStatus",
    shortname = "vc"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterSpec {
    /// Name of the cluster version template the tenant was provisioned from.
    pub cluster_version_ref: String,
    /// How the tenant API server is exposed.
    #[serde(default)]
    pub service_type: ServiceType,
    /// Name of the secret (in the descriptor's namespace) holding the admin
    /// kubeconfig used to reach the tenant API server.
    pub admin_kubeconfig_secret_ref: String,
}

/// Observed state of a `VirtualCluster`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterStatus {
    /// Coarse lifecycle phase, for `kubectl get` columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Detailed conditions recorded by the syncer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DescriptorCondition>,
}

/// One observed condition on a descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorCondition {
    /// Condition type, e.g. `Ready`.
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    /// Machine-readable reason for the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC 3339 timestamp of the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Identity of the descriptor that owns a tenant cluster handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerInfo {
    /// Descriptor name.
    pub name: String,
    /// Descriptor namespace.
    pub namespace: String,
    /// Descriptor UID.
    pub uid: String,
}

impl VirtualCluster {
    /// Derive the stable cluster key for this descriptor.
    ///
    /// Returns `None` until the object has been persisted (i.e. while name,
    /// namespace or uid are unset).
    #[must_use]
    pub fn cluster_key(&self) -> Option<ClusterKey> {
        Some(ClusterKey::new(
            self.metadata.name.as_deref()?,
            self.metadata.namespace.as_deref()?,
            self.metadata.uid.as_deref()?,
        ))
    }

    /// The descriptor identity recorded on tenant cluster handles.
    #[must_use]
    pub fn owner_info(&self) -> Option<OwnerInfo> {
        Some(OwnerInfo {
            name: self.metadata.name.clone()?,
            namespace: self.metadata.namespace.clone()?,
            uid: self.metadata.uid.clone()?,
        })
    }
}
