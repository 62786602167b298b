//! Storage class adapter: a public kind, mirrored super → tenants.

use crate::{
    error::SyncError,
    sync::{scrub_copy, Adapter, SyncProfile},
};
use k8s_openapi::api::storage::v1::StorageClass;
use vcsync_core::{equality, projection, ClusterKey, Delegate};

/// Mirrors public super-cluster storage classes into every tenant.
///
/// The super side is the source of truth: tenants receive faithful copies
/// of every storage class labelled public and lose copies that are retired.
#[derive(Default)]
pub struct StorageClassAdapter;

impl Adapter for StorageClassAdapter {
    type Object = StorageClass;

    fn name(&self) -> &'static str {
        "storageclass"
    }

    fn profile(&self) -> SyncProfile {
        SyncProfile::Public
    }

    fn location(&self, _cluster: &ClusterKey, _namespace: Option<&str>, name: &str) -> projection::Location {
        projection::Location {
            namespace: None,
            name: name.to_string(),
        }
    }

    fn project(
        &self,
        _delegate: &Delegate,
        _location: &projection::Location,
        v: &StorageClass,
    ) -> Result<StorageClass, SyncError> {
        self.project_public(v)
    }

    fn downward_equal(&self, projected: &StorageClass, p: &StorageClass) -> bool {
        // Symmetric: scrub both sides and compare everything that is left
        // (provisioner, parameters, binding mode, metadata, ...).
        equality::values_equal(&scrub_copy(projected), &scrub_copy(p))
    }

    fn sync_status(&self) -> bool {
        false
    }
}
