//! Event adapter: super-cluster events are written up into the owning
//! tenant with their object references remapped.

use crate::{
    api::ApiError,
    error::SyncError,
    sync::{scrub_copy, Adapter, SyncProfile, SyncerContext},
    upward::UpwardRequest,
};
use k8s_openapi::api::core::v1::{Event, ObjectReference, Pod};
use kube::api::ApiResource;
use tracing::debug;
use vcsync_core::{projection, Delegate};

/// Upsyncs events recorded against physical objects into the tenant that
/// owns them.
///
/// Events carry no delegation annotations of their own; the upward queue
/// resolves their target through the namespace index, and this adapter
/// remaps `involvedObject` to the corresponding virtual object before
/// creating the tenant-side copy.
#[derive(Default)]
pub struct EventAdapter;

#[async_trait::async_trait]
impl Adapter for EventAdapter {
    type Object = Event;

    fn name(&self) -> &'static str {
        "event"
    }

    fn profile(&self) -> SyncProfile {
        SyncProfile::UpwardOnly
    }

    fn project(
        &self,
        _delegate: &Delegate,
        _location: &projection::Location,
        _v: &Event,
    ) -> Result<Event, SyncError> {
        Err(SyncError::Adapter("events do not propagate downward".to_string()))
    }

    fn downward_equal(&self, _projected: &Event, _p: &Event) -> bool {
        true
    }

    fn sync_status(&self) -> bool {
        false
    }

    async fn back_populate(
        &self,
        ctx: &SyncerContext<Event>,
        request: &UpwardRequest,
    ) -> Result<(), SyncError> {
        let Some(cluster) = ctx.mc().cluster(&request.cluster) else {
            return Ok(());
        };
        let Some(tenant_ns) = request.namespace.clone() else {
            return Ok(());
        };
        let location = projection::Location {
            namespace: Some(request.cluster.super_namespace(&tenant_ns)),
            name: request.name.clone(),
        };
        let Some(p) = ctx.super_object(&location) else {
            return Ok(());
        };

        let involved = &p.involved_object;
        let (Some(kind), Some(involved_name)) = (involved.kind.clone(), involved.name.clone()) else {
            return Ok(());
        };
        // Only references the tenant can resolve are remapped; everything
        // else stays on the super side.
        let resource = match kind.as_str() {
            "Pod" => ApiResource::erase::<Pod>(&()),
            _ => {
                debug!(%kind, "not upsyncing event for unhandled kind");
                return Ok(());
            }
        };
        let raw = cluster.backend().api(&resource);
        let Some(target) = raw.get(Some(&tenant_ns), &involved_name).await? else {
            debug!(name = %involved_name, "tenant object for event is gone");
            return Ok(());
        };

        let mut tenant_event = scrub_copy(&*p);
        tenant_event.metadata.namespace = Some(tenant_ns.clone());
        tenant_event.involved_object = ObjectReference {
            api_version: involved.api_version.clone(),
            kind: Some(kind),
            name: Some(involved_name),
            namespace: Some(tenant_ns.clone()),
            uid: target.metadata.uid.clone(),
            ..ObjectReference::default()
        };
        let api = cluster.api::<Event>();
        match api.create(Some(&tenant_ns), &tenant_event).await {
            Ok(_) | Err(ApiError::AlreadyExists) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
