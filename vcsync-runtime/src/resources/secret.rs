//! Secret adapter.

use crate::{error::SyncError, sync::Adapter};
use k8s_openapi::api::core::v1::Secret;
use vcsync_core::{equality, projection, Delegate};

/// Kubernetes-managed service account token secrets.
const SERVICE_ACCOUNT_TOKEN: &str = "kubernetes.io/service-account-token";

/// Syncs tenant secrets downward.
///
/// Service-account token secrets are excluded: each control plane mints its
/// own tokens and a projected copy would never validate against the super
/// API server anyway.
#[derive(Default)]
pub struct SecretAdapter;

impl Adapter for SecretAdapter {
    type Object = Secret;

    fn name(&self) -> &'static str {
        "secret"
    }

    fn excluded(&self, v: &Secret) -> bool {
        v.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN)
    }

    fn project(
        &self,
        delegate: &Delegate,
        location: &projection::Location,
        v: &Secret,
    ) -> Result<Secret, SyncError> {
        Ok(Secret {
            metadata: projection::projected_meta(&v.metadata, delegate, location.clone()),
            data: v.data.clone(),
            immutable: v.immutable,
            type_: v.type_.clone(),
            // `stringData` is a write-only convenience; the cached object
            // carries the canonical bytes in `data`.
            string_data: None,
        })
    }

    fn downward_equal(&self, projected: &Secret, p: &Secret) -> bool {
        equality::meta_equal(&projected.metadata, &p.metadata)
            && equality::values_equal(&projected.data, &p.data)
            && projected.type_ == p.type_
            && projected.immutable == p.immutable
    }

    fn sync_status(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString};
    use std::collections::BTreeMap;
    use vcsync_core::ClusterKey;

    fn secret(name: &str, type_: Option<&str>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("u-1".to_string()),
                ..ObjectMeta::default()
            },
            type_: type_.map(String::from),
            data: Some(BTreeMap::from([(
                "token".to_string(),
                ByteString(b"opaque".to_vec()),
            )])),
            ..Secret::default()
        }
    }

    #[test]
    fn token_secrets_are_excluded() {
        let adapter = SecretAdapter;
        assert!(adapter.excluded(&secret("default-token-abcde", Some(SERVICE_ACCOUNT_TOKEN))));
        assert!(!adapter.excluded(&secret("app-credentials", Some("Opaque"))));
        assert!(!adapter.excluded(&secret("untyped", None)));
    }

    #[test]
    fn projection_carries_data_but_not_string_data() {
        let adapter = SecretAdapter;
        let key = ClusterKey::new("vc", "t1", "uid-1");
        let mut v = secret("app-credentials", Some("Opaque"));
        v.string_data = Some(BTreeMap::from([("extra".to_string(), "plain".to_string())]));
        let delegate = projection::delegate_for(&key, "default", &v.metadata).unwrap();
        let location = projection::Location::namespaced(&key, "default", "app-credentials");
        let p = adapter.project(&delegate, &location, &v).unwrap();
        assert_eq!(p.data, v.data);
        assert_eq!(p.string_data, None);
        assert_eq!(p.metadata.namespace.as_deref(), Some("vc-t1-uid-1-default"));
    }

    #[test]
    fn data_drift_is_detected() {
        let adapter = SecretAdapter;
        let key = ClusterKey::new("vc", "t1", "uid-1");
        let v = secret("app-credentials", Some("Opaque"));
        let delegate = projection::delegate_for(&key, "default", &v.metadata).unwrap();
        let location = projection::Location::namespaced(&key, "default", "app-credentials");
        let projected = adapter.project(&delegate, &location, &v).unwrap();
        let mut p = projected.clone();
        assert!(adapter.downward_equal(&projected, &p));
        p.data = Some(BTreeMap::from([(
            "token".to_string(),
            ByteString(b"rotated".to_vec()),
        )]));
        assert!(!adapter.downward_equal(&projected, &p));
    }
}
