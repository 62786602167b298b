//! Namespace adapter: tenant namespaces become cluster-scoped super
//! namespaces named `{clusterKey}-{tenantNamespace}`.

use crate::{
    downward::SyncEvent,
    error::SyncError,
    nsindex::SuperNamespaceIndex,
    sync::Adapter,
    upward::UpwardRequest,
};
use k8s_openapi::api::core::v1::Namespace;
use std::sync::Arc;
use vcsync_core::{equality, projection, ClusterKey, Delegate};

/// Syncs tenant namespaces downward and keeps the namespace index current.
pub struct NamespaceAdapter {
    index: Arc<SuperNamespaceIndex>,
}

impl NamespaceAdapter {
    /// Build the adapter around the shared namespace index.
    #[must_use]
    pub fn new(index: Arc<SuperNamespaceIndex>) -> Self {
        Self { index }
    }
}

impl Adapter for NamespaceAdapter {
    type Object = Namespace;

    fn name(&self) -> &'static str {
        "namespace"
    }

    fn tenant_namespace<'a>(&self, _namespace: Option<&'a str>, name: &'a str) -> &'a str {
        // A namespace's "tenant namespace" is its own name.
        name
    }

    fn location(&self, cluster: &ClusterKey, _namespace: Option<&str>, name: &str) -> projection::Location {
        projection::Location::cluster_scoped(cluster, name)
    }

    fn project(
        &self,
        delegate: &Delegate,
        location: &projection::Location,
        v: &Namespace,
    ) -> Result<Namespace, SyncError> {
        Ok(Namespace {
            metadata: projection::projected_meta(&v.metadata, delegate, location.clone()),
            // Spec finalizers and status phase are populated by each
            // cluster's own controllers.
            spec: None,
            status: None,
        })
    }

    fn downward_equal(&self, projected: &Namespace, p: &Namespace) -> bool {
        equality::meta_equal(&projected.metadata, &p.metadata)
    }

    fn sync_status(&self) -> bool {
        false
    }

    fn upward_request(&self, delegate: &Delegate, _p: &Namespace) -> UpwardRequest {
        UpwardRequest::new(delegate.cluster.clone(), None, delegate.namespace.clone())
    }

    fn on_super_event(&self, event: SyncEvent, obj: &Namespace) {
        match event {
            SyncEvent::Add | SyncEvent::Update => self.index.observe(obj),
            SyncEvent::Delete => {
                if let Some(name) = obj.metadata.name.as_deref() {
                    self.index.forget(name);
                }
            }
        }
    }
}
