//! Config map adapter.

use crate::{error::SyncError, sync::Adapter};
use k8s_openapi::api::core::v1::ConfigMap;
use vcsync_core::{equality, projection, Delegate};

/// Syncs tenant config maps downward.
#[derive(Default)]
pub struct ConfigMapAdapter;

impl Adapter for ConfigMapAdapter {
    type Object = ConfigMap;

    fn name(&self) -> &'static str {
        "configmap"
    }

    fn excluded(&self, v: &ConfigMap) -> bool {
        // Every namespace gets a root-certificate config map from its own
        // control plane; the super side provisions its own copy.
        v.metadata.name.as_deref() == Some("kube-root-ca.crt")
    }

    fn project(
        &self,
        delegate: &Delegate,
        location: &projection::Location,
        v: &ConfigMap,
    ) -> Result<ConfigMap, SyncError> {
        Ok(ConfigMap {
            metadata: projection::projected_meta(&v.metadata, delegate, location.clone()),
            data: v.data.clone(),
            binary_data: v.binary_data.clone(),
            immutable: v.immutable,
        })
    }

    fn downward_equal(&self, projected: &ConfigMap, p: &ConfigMap) -> bool {
        equality::meta_equal(&projected.metadata, &p.metadata)
            && equality::values_equal(&projected.data, &p.data)
            && equality::values_equal(&projected.binary_data, &p.binary_data)
            && projected.immutable == p.immutable
    }

    fn sync_status(&self) -> bool {
        false
    }
}
