//! The upward controller: the super → tenant path.
//!
//! A single super-cluster informer per kind feeds a queue of
//! `(cluster, namespace-or-empty, name)` items. For managed kinds the item
//! targets the one tenant the physical object delegates to; for public
//! kinds every super event fans out into one item per attached tenant.

use crate::{
    error::SyncError,
    queue::{run_queue, QueueItem, ScheduleRequest},
    sync::{Adapter, SyncMode, SyncObject, SyncerContext, SyncerOptions},
};
use educe::Educe;
use futures::channel::mpsc;
use kube::Resource;
use parking_lot::Mutex;
use std::{
    fmt::{self, Display},
    sync::Arc,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use vcsync_core::{delegate, equality, projection::Location, ClusterKey, Delegate};

/// An upward work item: one tenant-side object to back-populate.
#[derive(Educe, Clone, Debug)]
#[educe(PartialEq, Eq, Hash)]
pub struct UpwardRequest {
    /// The tenant to write into.
    pub cluster: ClusterKey,
    /// Tenant-side namespace; `None` for cluster-scoped and public kinds.
    pub namespace: Option<String>,
    /// Tenant-side object name.
    pub name: String,
    /// Failed executions so far.
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub attempts: u32,
    /// When this item first failed.
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub first_failure: Option<Instant>,
}

impl UpwardRequest {
    /// A fresh work item with zeroed retry accounting.
    #[must_use]
    pub fn new(cluster: ClusterKey, namespace: Option<String>, name: String) -> Self {
        Self {
            cluster,
            namespace,
            name,
            attempts: 0,
            first_failure: None,
        }
    }
}

impl Display for UpwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{ns}/{}", self.cluster, self.name),
            None => write!(f, "{}/{}", self.cluster, self.name),
        }
    }
}

impl QueueItem for UpwardRequest {
    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn first_failure(&self) -> Option<Instant> {
        self.first_failure
    }

    fn retried(&self, first_failure: Instant) -> Self {
        Self {
            attempts: self.attempts + 1,
            first_failure: Some(first_failure),
            ..self.clone()
        }
    }
}

/// Single-cluster queue whose reconciler reads super and writes tenants.
pub struct UpwardController {
    options: Arc<SyncerOptions>,
    tx: mpsc::UnboundedSender<ScheduleRequest<UpwardRequest>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ScheduleRequest<UpwardRequest>>>>,
}

impl UpwardController {
    pub(crate) fn new(options: Arc<SyncerOptions>) -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            options,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue an upward work item.
    pub fn enqueue(&self, request: UpwardRequest) {
        let _ = self.tx.unbounded_send(ScheduleRequest::now(request));
    }

    /// Run the worker pool until `stop` is cancelled.
    pub(crate) async fn run<A>(
        &self,
        adapter: &Arc<A>,
        ctx: &Arc<SyncerContext<A::Object>>,
        stop: CancellationToken,
    ) -> Result<(), SyncError>
    where
        A: Adapter,
    {
        let Some(rx) = self.rx.lock().take() else {
            warn!("upward worker pool already running");
            return Ok(());
        };
        let workers = self.options.uws_workers;
        let policy = self.options.retry.clone();
        run_queue(rx, workers, policy, stop, |request| {
            let adapter = adapter.clone();
            let ctx = ctx.clone();
            let request = request.clone();
            Box::pin(async move { adapter.back_populate(&ctx, &request).await })
        })
        .await;
        Ok(())
    }
}

/// Translate one super-side informer event into upward work items.
///
/// Managed objects resolve their target through their own delegation
/// annotations; annotation-less namespaced objects (events written by
/// super-side controllers) fall back to the namespace index; public objects
/// fan out to every attached tenant.
pub(crate) fn enqueue_super_event<A: Adapter>(ctx: &SyncerContext<A::Object>, adapter: &A, obj: &A::Object) {
    if ctx.options().mode != SyncMode::Propagate {
        return;
    }
    let Some(name) = obj.meta().name.clone() else { return };
    if adapter.public() {
        if !delegate::is_public(obj.meta()) {
            return;
        }
        for cluster in ctx.mc().cluster_keys() {
            ctx.enqueue_upward(UpwardRequest::new(cluster, None, name.clone()));
        }
    } else if let Some(delegate) = Delegate::of(obj.meta()) {
        ctx.enqueue_upward(adapter.upward_request(&delegate, obj));
    } else if let Some(found) = obj
        .meta()
        .namespace
        .as_deref()
        .and_then(|ns| ctx.nsindex().resolve(ns))
    {
        ctx.enqueue_upward(UpwardRequest::new(found.cluster, Some(found.namespace), name));
    }
}

/// The standard upward reconcile for managed kinds.
///
/// Applies the adapter's upward field policy (declared labels/annotations,
/// optionally spec) through a tenant update, then a separate status
/// subresource update when the status sections differ. UID delegation is
/// validated against the cached virtual object before any write.
pub async fn back_populate<A: Adapter>(
    ctx: &SyncerContext<A::Object>,
    adapter: &A,
    request: &UpwardRequest,
) -> Result<(), SyncError> {
    let Some(cluster) = ctx.mc().cluster(&request.cluster) else {
        return Ok(());
    };
    let location = adapter.location(&request.cluster, request.namespace.as_deref(), &request.name);
    let Some(p) = ctx.super_object(&location) else {
        return Ok(());
    };
    let Some(found) = Delegate::of(p.meta()) else {
        return Err(SyncError::Adapter(format!(
            "{request}: physical object has no delegation annotations"
        )));
    };
    let Some(v) = ctx
        .mc()
        .get(&request.cluster, request.namespace.as_deref(), &request.name)
    else {
        // The virtual object is gone; the patroller collects the orphan.
        return Ok(());
    };
    let v_uid = v.meta().uid.clone().unwrap_or_default();
    if v_uid != found.uid {
        return Err(SyncError::DelegationConflict {
            reference: request.to_string(),
            expected: v_uid,
            found: found.uid,
        });
    }

    let api = cluster.api::<A::Object>();
    let policy = adapter.upward_meta();
    let mut updated = (*v).clone();
    let mut meta_changed = false;
    for key in equality::changed_keys(policy.labels, p.meta().labels.as_ref(), v.meta().labels.as_ref()) {
        let value = p.meta().labels.as_ref().and_then(|m| m.get(key)).cloned();
        let labels = updated.meta_mut().labels.get_or_insert_with(Default::default);
        match value {
            Some(value) => {
                labels.insert(key.to_string(), value);
            }
            None => {
                labels.remove(key);
            }
        }
        meta_changed = true;
    }
    for key in equality::changed_keys(
        policy.annotations,
        p.meta().annotations.as_ref(),
        v.meta().annotations.as_ref(),
    ) {
        let value = p.meta().annotations.as_ref().and_then(|m| m.get(key)).cloned();
        let annotations = updated.meta_mut().annotations.get_or_insert_with(Default::default);
        match value {
            Some(value) => {
                annotations.insert(key.to_string(), value);
            }
            None => {
                annotations.remove(key);
            }
        }
        meta_changed = true;
    }
    let spec_changed = match adapter.upward_spec_policy() {
        crate::sync::UpwardSpecPolicy::StatusOnly => false,
        crate::sync::UpwardSpecPolicy::SpecAndStatus => adapter.apply_upward_spec(&mut updated, &p),
    };
    if meta_changed || spec_changed {
        updated = api
            .replace(request.namespace.as_deref(), &request.name, &updated)
            .await?;
    }

    if adapter.sync_status() && !equality::status_equal(&*v, &*p) {
        let with_status = splice_status(&updated, &p)?;
        api.replace_status(request.namespace.as_deref(), &request.name, &with_status)
            .await?;
    }
    Ok(())
}

/// The upward reconcile for public kinds: make one tenant's copy of a
/// public super object match the super side, creating, updating or deleting
/// as needed. Super is the source of truth.
pub async fn back_populate_public<A: Adapter>(
    ctx: &SyncerContext<A::Object>,
    adapter: &A,
    request: &UpwardRequest,
) -> Result<(), SyncError> {
    let Some(cluster) = ctx.mc().cluster(&request.cluster) else {
        return Ok(());
    };
    let api = cluster.api::<A::Object>();
    let location = Location {
        namespace: None,
        name: request.name.clone(),
    };
    let source = ctx
        .super_object(&location)
        .filter(|p| delegate::is_public(p.meta()));
    match source {
        None => {
            // No longer published; drop the tenant copy if there is one.
            match api.delete(None, &request.name, None).await {
                Ok(()) | Err(crate::api::ApiError::NotFound) => Ok(()),
                Err(err) => Err(err.into()),
            }
        }
        Some(p) => {
            let desired = adapter.project_public(&p)?;
            match api.get(None, &request.name).await? {
                None => match api.create(None, &desired).await {
                    Ok(_) | Err(crate::api::ApiError::AlreadyExists) => Ok(()),
                    Err(err) => Err(err.into()),
                },
                Some(existing) => {
                    if adapter.downward_equal(&desired, &existing) {
                        Ok(())
                    } else {
                        let mut desired = desired;
                        desired.meta_mut().resource_version = existing.meta().resource_version.clone();
                        api.replace(None, &request.name, &desired).await?;
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Copy the status section of `source` onto `target` without touching
/// anything else.
fn splice_status<K: SyncObject>(target: &K, source: &K) -> Result<K, SyncError> {
    let mut target_value =
        serde_json::to_value(target).map_err(|err| SyncError::Adapter(err.to_string()))?;
    let source_value = serde_json::to_value(source).map_err(|err| SyncError::Adapter(err.to_string()))?;
    match source_value.get("status") {
        Some(status) => {
            target_value["status"] = status.clone();
        }
        None => {
            if let Some(map) = target_value.as_object_mut() {
                map.remove("status");
            }
        }
    }
    serde_json::from_value(target_value).map_err(|err| SyncError::Adapter(err.to_string()))
}
