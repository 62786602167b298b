//! Service account adapter.

use crate::{error::SyncError, sync::Adapter};
use k8s_openapi::api::core::v1::ServiceAccount;
use vcsync_core::{equality, projection, Delegate};

/// Syncs tenant service accounts downward.
///
/// Token secret references never cross clusters: the super control plane
/// mints its own tokens, so the `secrets` list is dropped from the
/// projection. The `default` account is excluded outright because the super
/// side's namespace controller provisions one in every namespace already.
#[derive(Default)]
pub struct ServiceAccountAdapter;

impl Adapter for ServiceAccountAdapter {
    type Object = ServiceAccount;

    fn name(&self) -> &'static str {
        "serviceaccount"
    }

    fn excluded(&self, v: &ServiceAccount) -> bool {
        v.metadata.name.as_deref() == Some("default")
    }

    fn project(
        &self,
        delegate: &Delegate,
        location: &projection::Location,
        v: &ServiceAccount,
    ) -> Result<ServiceAccount, SyncError> {
        Ok(ServiceAccount {
            metadata: projection::projected_meta(&v.metadata, delegate, location.clone()),
            automount_service_account_token: v.automount_service_account_token,
            image_pull_secrets: v.image_pull_secrets.clone(),
            secrets: None,
        })
    }

    fn downward_equal(&self, projected: &ServiceAccount, p: &ServiceAccount) -> bool {
        equality::meta_equal(&projected.metadata, &p.metadata)
            && projected.automount_service_account_token == p.automount_service_account_token
            && equality::values_equal(&projected.image_pull_secrets, &p.image_pull_secrets)
    }

    fn sync_status(&self) -> bool {
        false
    }
}
