//! The multi-cluster controller: the downward (tenant → super) path.
//!
//! One controller per resource kind fans in events from every attached
//! tenant to a single reconcile entry point. Informer handlers push work
//! items into the shared queue; a fixed worker pool dequeues them with
//! per-key serialization and converges the physical object with its
//! virtual counterpart.

use crate::{
    api::{ApiError, TypedApi},
    cluster::{spawn_informer, TenantCluster},
    error::SyncError,
    queue::{run_queue, QueueItem, ScheduleRequest},
    sync::{Adapter, FinalizerPolicy, SyncMode, SyncObject, SyncerContext, SyncerOptions},
};
use educe::Educe;
use futures::channel::mpsc;
use kube::{
    api::ApiResource,
    runtime::reflector::{ObjectRef, Store},
    Resource,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::Arc,
};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vcsync_core::{projection, ClusterKey, Delegate, OwnerInfo, VirtualClusterSpec};

/// What happened to the virtual object that produced a work item.
///
/// Reconciliation is level-based: the event only explains why the item was
/// queued, the reconcile always converges on current cache state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// The object appeared (or was listed during initial sync).
    Add,
    /// The object changed.
    Update,
    /// The object went away.
    Delete,
}

/// A downward work item: one virtual object of one tenant.
///
/// Equality and hashing cover only the queue key
/// (`cluster`/`namespace`/`name`); the event and the retry bookkeeping ride
/// along without affecting deduplication.
#[derive(Educe, Clone, Debug)]
#[educe(PartialEq, Eq, Hash)]
pub struct SyncRequest {
    /// Key of the tenant the object lives in.
    pub cluster: ClusterKey,
    /// Tenant-side namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Tenant-side object name.
    pub name: String,
    /// UID of the virtual object at event time.
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub uid: String,
    /// Why the item was queued.
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub event: SyncEvent,
    /// Failed executions so far.
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub attempts: u32,
    /// When this item first failed.
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub first_failure: Option<Instant>,
}

impl SyncRequest {
    /// A fresh work item with zeroed retry accounting.
    #[must_use]
    pub fn new(
        cluster: ClusterKey,
        namespace: Option<String>,
        name: String,
        uid: String,
        event: SyncEvent,
    ) -> Self {
        Self {
            cluster,
            namespace,
            name,
            uid,
            event,
            attempts: 0,
            first_failure: None,
        }
    }

    /// Build the work item for an observed object.
    #[must_use]
    pub fn from_object<K: SyncObject>(cluster: ClusterKey, obj: &K, event: SyncEvent) -> Self {
        let meta = obj.meta();
        Self::new(
            cluster,
            meta.namespace.clone(),
            meta.name.clone().unwrap_or_default(),
            meta.uid.clone().unwrap_or_default(),
            event,
        )
    }
}

impl Display for SyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{ns}/{}", self.cluster, self.name),
            None => write!(f, "{}/{}", self.cluster, self.name),
        }
    }
}

impl QueueItem for SyncRequest {
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

struct WatchedCluster<K: SyncObject> {
    cluster: Arc<TenantCluster>,
    store: Option<Store<K>>,
    stop: Option<CancellationToken>,
}

/// Fan-in controller over every attached tenant for one resource kind.
pub struct MultiClusterController<K: SyncObject> {
    resource: ApiResource,
    options: Arc<SyncerOptions>,
    tx: mpsc::UnboundedSender<ScheduleRequest<SyncRequest>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ScheduleRequest<SyncRequest>>>>,
    clusters: RwLock<HashMap<ClusterKey, WatchedCluster<K>>>,
}

impl<K: SyncObject> MultiClusterController<K> {
    pub(crate) fn new(resource: ApiResource, options: Arc<SyncerOptions>) -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            resource,
            options,
            tx,
            rx: Mutex::new(Some(rx)),
            clusters: RwLock::new(HashMap::new()),
        }
    }

    /// Attach `cluster` without watching it (kinds that have no tenant-side
    /// informer still need the cluster in the registry for fan-out and
    /// client lookups).
    pub fn register_cluster(&self, cluster: &Arc<TenantCluster>) {
        self.clusters.write().insert(
            cluster.key().clone(),
            WatchedCluster {
                cluster: cluster.clone(),
                store: None,
                stop: None,
            },
        );
    }

    /// Start the tenant informer for this kind on `cluster` and deliver its
    /// events to `listener`. Blocks until the cache syncs or the configured
    /// deadline elapses; on timeout the watch is cancelled and an error is
    /// returned without the cluster being attached.
    pub async fn watch_cluster_resource(
        &self,
        cluster: &Arc<TenantCluster>,
        listener: impl FnMut(SyncEvent, &K) + Send + 'static,
    ) -> Result<(), SyncError> {
        let stop = cluster.child_token();
        let store = spawn_informer::<K>(cluster.backend(), self.resource.clone(), stop.clone(), listener);
        match timeout(self.options.cache_sync_timeout, store.wait_until_ready()).await {
            Ok(Ok(())) => {}
            _ => {
                stop.cancel();
                return Err(SyncError::CacheSync {
                    reference: format!("{}/{}", cluster.key(), self.resource.kind),
                });
            }
        }
        self.clusters.write().insert(
            cluster.key().clone(),
            WatchedCluster {
                cluster: cluster.clone(),
                store: Some(store),
                stop: Some(stop),
            },
        );
        Ok(())
    }

    /// Detach `cluster`: remove its handlers, stop its informer, and leave
    /// any queued items for it to be dropped at dispatch.
    pub fn teardown_cluster_resource(&self, key: &ClusterKey) {
        if let Some(watched) = self.clusters.write().remove(key) {
            if let Some(stop) = watched.stop {
                stop.cancel();
            }
            debug!(cluster = %key, kind = %self.resource.kind, "cluster watch torn down");
        }
    }

    /// Whether `key` is currently attached.
    #[must_use]
    pub fn has_cluster(&self, key: &ClusterKey) -> bool {
        self.clusters.read().contains_key(key)
    }

    /// The attached cluster handle for `key`.
    #[must_use]
    pub fn cluster(&self, key: &ClusterKey) -> Option<Arc<TenantCluster>> {
        self.clusters.read().get(key).map(|w| w.cluster.clone())
    }

    /// Snapshot of all attached cluster keys.
    #[must_use]
    pub fn cluster_keys(&self) -> Vec<ClusterKey> {
        self.clusters.read().keys().cloned().collect()
    }

    /// Read one object through the tenant cache.
    #[must_use]
    pub fn get(&self, key: &ClusterKey, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        let clusters = self.clusters.read();
        let store = clusters.get(key)?.store.as_ref()?;
        let mut obj_ref = ObjectRef::new(name);
        if let Some(ns) = namespace {
            obj_ref = obj_ref.within(ns);
        }
        store.get(&obj_ref)
    }

    /// List every cached object of one tenant.
    #[must_use]
    pub fn list(&self, key: &ClusterKey) -> Vec<Arc<K>> {
        let clusters = self.clusters.read();
        clusters
            .get(key)
            .and_then(|w| w.store.as_ref())
            .map(Store::state)
            .unwrap_or_default()
    }

    /// The tenant's API backend.
    #[must_use]
    pub fn cluster_client(&self, key: &ClusterKey) -> Option<Arc<dyn crate::api::ApiBackend>> {
        self.cluster(key).map(|c| c.backend())
    }

    /// Identity of the descriptor owning `key`.
    #[must_use]
    pub fn owner_info(&self, key: &ClusterKey) -> Option<OwnerInfo> {
        self.cluster(key).map(|c| c.owner_info().clone())
    }

    /// The descriptor spec snapshot for `key`.
    #[must_use]
    pub fn descriptor_spec(&self, key: &ClusterKey) -> Option<VirtualClusterSpec> {
        self.cluster(key).map(|c| c.spec().clone())
    }

    /// Queue a reconcile for `obj`, used by the patroller.
    pub fn requeue_object(&self, key: &ClusterKey, obj: &K, event: SyncEvent) {
        self.enqueue(SyncRequest::from_object(key.clone(), obj, event));
    }

    /// Queue an explicit work item.
    pub fn enqueue(&self, request: SyncRequest) {
        let _ = self.tx.unbounded_send(ScheduleRequest::now(request));
    }

    /// Run the worker pool until `stop` is cancelled. Items whose cluster
    /// has been detached are dropped at dispatch.
    pub(crate) async fn run<A>(
        &self,
        adapter: &Arc<A>,
        ctx: &Arc<SyncerContext<K>>,
        stop: CancellationToken,
    ) -> Result<(), SyncError>
    where
        A: Adapter<Object = K>,
    {
        let Some(rx) = self.rx.lock().take() else {
            warn!(kind = %self.resource.kind, "downward worker pool already running");
            return Ok(());
        };
        let workers = self.options.dws_workers;
        let policy = self.options.retry.clone();
        run_queue(rx, workers, policy, stop, |request| {
            let adapter = adapter.clone();
            let ctx = ctx.clone();
            let request = request.clone();
            Box::pin(async move {
                if !ctx.mc().has_cluster(&request.cluster) {
                    debug!(item = %request, "dropping work item for detached cluster");
                    return Ok(());
                }
                adapter.reconcile(&ctx, &request).await
            })
        })
        .await;
        Ok(())
    }
}

fn conflict(reference: String, expected: &str, found: Option<&str>) -> SyncError {
    SyncError::DelegationConflict {
        reference,
        expected: expected.to_string(),
        found: found.unwrap_or("<unmanaged>").to_string(),
    }
}

/// The standard downward reconcile: converge the physical object with the
/// virtual one.
///
/// Idempotent by construction: when the physical object already matches the
/// canonical projection, no write is issued. UID fidelity is enforced
/// against a fresh read of the physical object before every write.
pub async fn reconcile<A: Adapter>(
    ctx: &SyncerContext<A::Object>,
    adapter: &A,
    request: &SyncRequest,
) -> Result<(), SyncError> {
    if ctx.options().mode == SyncMode::Ignore {
        return Ok(());
    }
    if !ctx.mc().has_cluster(&request.cluster) {
        return Ok(());
    }
    let location = adapter.location(&request.cluster, request.namespace.as_deref(), &request.name);
    let super_api = ctx.super_api();
    let virtual_obj = ctx.mc().get(&request.cluster, request.namespace.as_deref(), &request.name);

    let propagate = match &virtual_obj {
        _ if ctx.options().mode == SyncMode::Remove => None,
        Some(v) if adapter.excluded(v) => None,
        Some(v) if v.meta().deletion_timestamp.is_some() => {
            match adapter.finalizer_policy() {
                // The projection outlives the virtual object until its
                // finalizers resolve; the delete event does the cleanup.
                FinalizerPolicy::Block => return Ok(()),
                FinalizerPolicy::Force => None,
            }
        }
        Some(v) => Some(v.clone()),
        None => None,
    };

    match propagate {
        Some(v) => {
            let tenant_ns = adapter.tenant_namespace(request.namespace.as_deref(), &request.name);
            let delegate = projection::delegate_for(&request.cluster, tenant_ns, v.meta())?;
            let projected = adapter.project(&delegate, &location, &v)?;
            match super_api.get(location.namespace.as_deref(), &location.name).await? {
                None => match super_api.create(location.namespace.as_deref(), &projected).await {
                    Ok(_) => Ok(()),
                    Err(ApiError::AlreadyExists) => {
                        // Raced another writer; success only if the winner
                        // delegates to the same virtual object.
                        let current = super_api.get(location.namespace.as_deref(), &location.name).await?;
                        let found = current.as_ref().and_then(|p| Delegate::of(p.meta()));
                        match found {
                            Some(d) if d.uid == delegate.uid => Ok(()),
                            other => Err(conflict(
                                request.to_string(),
                                &delegate.uid,
                                other.as_ref().map(|d| d.uid.as_str()),
                            )),
                        }
                    }
                    Err(err) => Err(err.into()),
                },
                Some(p) => match Delegate::of(p.meta()) {
                    Some(d) if d.uid == delegate.uid => {
                        if adapter.downward_equal(&projected, &p) {
                            Ok(())
                        } else {
                            let mut desired = projected;
                            desired.meta_mut().resource_version = p.meta().resource_version.clone();
                            super_api
                                .replace(location.namespace.as_deref(), &location.name, &desired)
                                .await?;
                            Ok(())
                        }
                    }
                    other => Err(conflict(
                        request.to_string(),
                        &delegate.uid,
                        other.as_ref().map(|d| d.uid.as_str()),
                    )),
                },
            }
        }
        None => ensure_absent(ctx, request, &location, &super_api).await,
    }
}

/// Remove the physical projection of a virtual object that is gone (or
/// excluded), respecting UID preconditions throughout.
async fn ensure_absent<K: SyncObject>(
    _ctx: &SyncerContext<K>,
    request: &SyncRequest,
    location: &projection::Location,
    super_api: &TypedApi<K>,
) -> Result<(), SyncError> {
    let Some(p) = super_api.get(location.namespace.as_deref(), &location.name).await? else {
        return Ok(());
    };
    let Some(delegate) = Delegate::of(p.meta()) else {
        // Not managed by the syncer; leave it alone.
        return Ok(());
    };
    if delegate.cluster != request.cluster {
        return Ok(());
    }
    if !request.uid.is_empty() && delegate.uid != request.uid {
        debug!(item = %request, "skipping delete for a different object incarnation");
        return Ok(());
    }
    match super_api
        .delete(
            location.namespace.as_deref(),
            &location.name,
            p.meta().uid.as_deref(),
        )
        .await
    {
        // A lost precondition or a concurrent delete both mean the object
        // we read is no longer there to remove.
        Ok(()) | Err(ApiError::Conflict | ApiError::NotFound) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
