//! The per-kind resource syncer: adapter contract, shared context, and the
//! registry that wires every kind into the lifecycle manager.
//!
//! Each synced kind contributes an [`Adapter`]: a declarative policy surface
//! (what is excluded, what the projection looks like, which fields flow in
//! which direction) plus overridable reconcile/back-populate/patrol bodies
//! that default to the standard flows in [`downward`](crate::downward),
//! [`upward`](crate::upward) and [`patrol`](crate::patrol). The generic
//! plumbing around an adapter (queues, informers, cluster attach/detach)
//! is [`ResourceSyncer`], registered once per kind in a [`SyncerRegistry`].

use crate::{
    api::{ApiBackend, TypedApi},
    cluster::{spawn_informer, TenantCluster},
    downward::{self, MultiClusterController, SyncEvent, SyncRequest},
    error::SyncError,
    nsindex::SuperNamespaceIndex,
    patrol::{self, PatrolStats, Patroller},
    queue::RetryPolicy,
    upward::{self, enqueue_super_event, UpwardController, UpwardRequest},
};
use kube::{
    api::ApiResource,
    runtime::reflector::{Lookup, ObjectRef, Store},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, sync::Arc, time::Duration};
use tokio::{sync::OnceCell, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use vcsync_core::{delegate, projection::Location, ClusterKey, Delegate};

/// Bounds every synced object type satisfies.
pub trait SyncObject:
    Resource<DynamicType = ()>
    + Lookup<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> SyncObject for K where
    K: Resource<DynamicType = ()>
        + Lookup<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Per-kind propagation mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Project tenant objects onto the super cluster and back-populate.
    #[default]
    Propagate,
    /// Leave the kind alone entirely.
    Ignore,
    /// Remove existing projections and create no new ones.
    Remove,
}

/// Which direction a kind's objects flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncProfile {
    /// Tenant-owned objects projected downward, with status flowing back.
    Downward,
    /// Super-owned objects mirrored into every tenant.
    Public,
    /// Super-originated objects written into the owning tenant only.
    UpwardOnly,
}

/// Whether upward sync may touch `spec` fields for kinds whose adapters set
/// them server-side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpwardSpecPolicy {
    /// Only status (and declared metadata) flows upward.
    #[default]
    StatusOnly,
    /// The adapter's `apply_upward_spec` hook also runs.
    SpecAndStatus,
}

/// Whether a virtual object holding finalizers blocks deletion of its
/// projection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FinalizerPolicy {
    /// Wait for the finalizers to resolve before collecting the projection.
    #[default]
    Block,
    /// Collect the projection regardless.
    Force,
}

/// The labels and annotations an adapter lets flow upward.
///
/// Defaults to nothing: the group owning the delegation annotations never
/// flows back.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpwardMeta {
    /// Label keys copied super → tenant.
    pub labels: &'static [&'static str],
    /// Annotation keys copied super → tenant.
    pub annotations: &'static [&'static str],
}

/// Tuning knobs for one resource syncer.
#[derive(Clone, Debug)]
pub struct SyncerOptions {
    /// Per-kind propagation mode.
    pub mode: SyncMode,
    /// Downward worker count.
    pub dws_workers: usize,
    /// Upward worker count.
    pub uws_workers: usize,
    /// Patrol period.
    pub patrol_period: Duration,
    /// Whether the patroller runs at all.
    pub patrol_enabled: bool,
    /// Retry budget and backoff for both queues.
    pub retry: RetryPolicy,
    /// How long cache syncs may take before attach fails.
    pub cache_sync_timeout: Duration,
}

impl Default for SyncerOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::Propagate,
            dws_workers: 4,
            uws_workers: 4,
            patrol_period: Duration::from_secs(60),
            patrol_enabled: true,
            retry: RetryPolicy::default(),
            cache_sync_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncerOptions {
    /// Set the propagation mode.
    #[must_use]
    pub fn mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set both worker counts.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.dws_workers = workers;
        self.uws_workers = workers;
        self
    }

    /// Set the patrol period.
    #[must_use]
    pub fn patrol_period(mut self, period: Duration) -> Self {
        self.patrol_period = period;
        self
    }

    /// Enable or disable the patroller.
    #[must_use]
    pub fn patrol_enabled(mut self, enabled: bool) -> Self {
        self.patrol_enabled = enabled;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the cache sync deadline.
    #[must_use]
    pub fn cache_sync_timeout(mut self, deadline: Duration) -> Self {
        self.cache_sync_timeout = deadline;
        self
    }
}

/// A copy of `obj` with every server-populated metadata field cleared,
/// ready to be created in another cluster.
#[must_use]
pub fn scrub_copy<K: SyncObject>(obj: &K) -> K {
    let mut copy = obj.clone();
    let meta = copy.meta_mut();
    meta.resource_version = None;
    meta.uid = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.managed_fields = None;
    meta.owner_references = None;
    copy
}

/// The per-kind plugin: policy surface plus overridable operation bodies.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync + Sized + 'static {
    /// The synced object type.
    type Object: SyncObject;

    /// Queue and log name of the kind, e.g. `"namespace"`.
    fn name(&self) -> &'static str;

    /// Which direction this kind's objects flow.
    fn profile(&self) -> SyncProfile {
        SyncProfile::Downward
    }

    /// Whether this kind is mirrored into every tenant.
    fn public(&self) -> bool {
        matches!(self.profile(), SyncProfile::Public)
    }

    /// Objects that are never synced (e.g. controller-provisioned ones).
    fn excluded(&self, _v: &Self::Object) -> bool {
        false
    }

    /// The tenant namespace recorded in the delegation annotations. It must
    /// be non-empty; cluster-scoped kinds override this to map something
    /// else (the `Namespace` kind uses the object's own name), and a
    /// namespaced object observed without a namespace fails projection
    /// instead of silently delegating to the root namespace.
    fn tenant_namespace<'a>(&self, namespace: Option<&'a str>, _name: &'a str) -> &'a str {
        namespace.unwrap_or_default()
    }

    /// Where the physical projection of `(namespace, name)` lives.
    fn location(&self, cluster: &ClusterKey, namespace: Option<&str>, name: &str) -> Location {
        Location::namespaced(cluster, namespace.unwrap_or_default(), name)
    }

    /// Build the physical rendition of a virtual object.
    fn project(
        &self,
        delegate: &Delegate,
        location: &Location,
        v: &Self::Object,
    ) -> Result<Self::Object, SyncError>;

    /// Build the tenant rendition of a public super object.
    fn project_public(&self, p: &Self::Object) -> Result<Self::Object, SyncError> {
        Ok(scrub_copy(p))
    }

    /// Whether the projection and the live physical object agree on the
    /// downward field set. For public kinds the comparison is symmetric.
    fn downward_equal(&self, projected: &Self::Object, p: &Self::Object) -> bool;

    /// Metadata keys that flow upward.
    fn upward_meta(&self) -> UpwardMeta {
        UpwardMeta::default()
    }

    /// Whether status flows upward for this kind.
    fn sync_status(&self) -> bool {
        true
    }

    /// Whether upward sync may touch spec fields.
    fn upward_spec_policy(&self) -> UpwardSpecPolicy {
        UpwardSpecPolicy::default()
    }

    /// Copy server-set spec fields super → tenant; returns whether anything
    /// changed. Only consulted under [`UpwardSpecPolicy::SpecAndStatus`].
    fn apply_upward_spec(&self, _v: &mut Self::Object, _p: &Self::Object) -> bool {
        false
    }

    /// How virtual-object finalizers interact with projection deletion.
    fn finalizer_policy(&self) -> FinalizerPolicy {
        FinalizerPolicy::default()
    }

    /// The upward work item targeting the virtual object a physical object
    /// delegates to.
    fn upward_request(&self, delegate: &Delegate, p: &Self::Object) -> UpwardRequest {
        UpwardRequest::new(
            delegate.cluster.clone(),
            Some(delegate.namespace.clone()),
            p.meta().name.clone().unwrap_or_default(),
        )
    }

    /// Observe raw super-side informer traffic (used by the namespace kind
    /// to feed the namespace index).
    fn on_super_event(&self, _event: SyncEvent, _obj: &Self::Object) {}

    /// Downward reconcile body.
    async fn reconcile(
        &self,
        ctx: &SyncerContext<Self::Object>,
        request: &SyncRequest,
    ) -> Result<(), SyncError> {
        downward::reconcile(ctx, self, request).await
    }

    /// Upward reconcile body.
    async fn back_populate(
        &self,
        ctx: &SyncerContext<Self::Object>,
        request: &UpwardRequest,
    ) -> Result<(), SyncError> {
        match self.profile() {
            SyncProfile::Public => upward::back_populate_public(ctx, self, request).await,
            _ => upward::back_populate(ctx, self, request).await,
        }
    }

    /// Patrol sweep body.
    async fn patrol(&self, ctx: &SyncerContext<Self::Object>) -> Result<PatrolStats, SyncError> {
        match self.profile() {
            SyncProfile::Public => patrol::sweep_public(ctx, self).await,
            _ => patrol::sweep(ctx, self).await,
        }
    }
}

/// Everything an adapter's operation bodies can reach: the cluster map and
/// tenant caches (through the MC), the super cache and client, the upward
/// queue, and the shared namespace index.
pub struct SyncerContext<K: SyncObject> {
    pub(crate) resource: ApiResource,
    pub(crate) super_backend: Arc<dyn ApiBackend>,
    pub(crate) super_cache: OnceCell<Store<K>>,
    pub(crate) mc: MultiClusterController<K>,
    pub(crate) uw: UpwardController,
    pub(crate) nsindex: Arc<SuperNamespaceIndex>,
    pub(crate) options: Arc<SyncerOptions>,
}

impl<K: SyncObject> SyncerContext<K> {
    /// The syncer's options.
    #[must_use]
    pub fn options(&self) -> &SyncerOptions {
        &self.options
    }

    /// The multi-cluster controller (cluster map plus tenant caches).
    #[must_use]
    pub fn mc(&self) -> &MultiClusterController<K> {
        &self.mc
    }

    /// The shared namespace index.
    #[must_use]
    pub fn nsindex(&self) -> &SuperNamespaceIndex {
        &self.nsindex
    }

    /// The super cluster's API backend.
    #[must_use]
    pub fn super_backend(&self) -> Arc<dyn ApiBackend> {
        self.super_backend.clone()
    }

    /// Typed API handle for this kind on the super cluster.
    #[must_use]
    pub fn super_api(&self) -> TypedApi<K> {
        TypedApi::new(&*self.super_backend)
    }

    /// Read one physical object through the super cache.
    #[must_use]
    pub fn super_object(&self, location: &Location) -> Option<Arc<K>> {
        let store = self.super_cache.get()?;
        let mut obj_ref = ObjectRef::new(&location.name);
        if let Some(ns) = &location.namespace {
            obj_ref = obj_ref.within(ns);
        }
        store.get(&obj_ref)
    }

    /// Snapshot of every cached physical object of this kind.
    #[must_use]
    pub fn super_state(&self) -> Vec<Arc<K>> {
        self.super_cache.get().map(Store::state).unwrap_or_default()
    }

    /// Queue an upward work item.
    pub fn enqueue_upward(&self, request: UpwardRequest) {
        self.uw.enqueue(request);
    }
}

/// Lifecycle surface the registry and manager drive, one per kind.
#[async_trait::async_trait]
pub trait Syncer: Send + Sync {
    /// Kind name for logs.
    fn name(&self) -> &'static str;

    /// Run the downward worker pool until `stop` is cancelled.
    async fn start_dws(&self, stop: CancellationToken) -> Result<(), SyncError>;

    /// Sync the super cache, then run the upward worker pool.
    async fn start_uws(&self, stop: CancellationToken) -> Result<(), SyncError>;

    /// Sync the super cache, then patrol at the configured period.
    async fn start_patrol(&self, stop: CancellationToken) -> Result<(), SyncError>;

    /// Announce a tenant's arrival.
    async fn add_cluster(&self, cluster: &Arc<TenantCluster>) -> Result<(), SyncError>;

    /// Announce a tenant's departure.
    async fn remove_cluster(&self, key: &ClusterKey);
}

/// Generic plumbing wiring one [`Adapter`] into queues, informers and the
/// cluster lifecycle.
pub struct ResourceSyncer<A: Adapter> {
    adapter: Arc<A>,
    ctx: Arc<SyncerContext<A::Object>>,
}

impl<A: Adapter> ResourceSyncer<A> {
    /// Build the syncer for `adapter` against the super cluster.
    #[must_use]
    pub fn new(
        adapter: A,
        super_backend: Arc<dyn ApiBackend>,
        nsindex: Arc<SuperNamespaceIndex>,
        options: SyncerOptions,
    ) -> Arc<Self> {
        let options = Arc::new(options);
        let resource = ApiResource::erase::<A::Object>(&());
        let ctx = Arc::new(SyncerContext {
            resource: resource.clone(),
            super_backend,
            super_cache: OnceCell::new(),
            mc: MultiClusterController::new(resource, options.clone()),
            uw: UpwardController::new(options.clone()),
            nsindex,
            options,
        });
        Arc::new(Self {
            adapter: Arc::new(adapter),
            ctx,
        })
    }

    /// The adapter this syncer runs.
    #[must_use]
    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    /// The shared context (caches, queues, cluster map).
    #[must_use]
    pub fn context(&self) -> &Arc<SyncerContext<A::Object>> {
        &self.ctx
    }

    /// A patroller over this syncer's adapter and context.
    #[must_use]
    pub fn patroller(&self) -> Patroller<A> {
        Patroller::new(self.adapter.clone(), self.ctx.clone())
    }

    /// Start the super-side informer once and wait for its cache to sync.
    /// Idempotent; both `start_uws` and `start_patrol` go through here.
    pub async fn sync_super_cache(&self, stop: &CancellationToken) -> Result<(), SyncError> {
        self.ctx
            .super_cache
            .get_or_try_init(|| {
                let handler_adapter = self.adapter.clone();
                let handler_ctx = self.ctx.clone();
                let ctx = self.ctx.clone();
                let watch_stop = stop.child_token();
                async move {
                    let store = spawn_informer::<A::Object>(
                        ctx.super_backend.clone(),
                        ctx.resource.clone(),
                        watch_stop.clone(),
                        move |event, obj| {
                            handler_adapter.on_super_event(event, obj);
                            enqueue_super_event(&handler_ctx, handler_adapter.as_ref(), obj);
                        },
                    );
                    match timeout(ctx.options.cache_sync_timeout, store.wait_until_ready()).await {
                        Ok(Ok(())) => Ok(store),
                        _ => {
                            watch_stop.cancel();
                            Err(SyncError::CacheSync {
                                reference: format!("super/{}", ctx.resource.kind),
                            })
                        }
                    }
                }
            })
            .await
            .map(|_| ())
    }
}

#[async_trait::async_trait]
impl<A: Adapter> Syncer for ResourceSyncer<A> {
    fn name(&self) -> &'static str {
        self.adapter.name()
    }

    async fn start_dws(&self, stop: CancellationToken) -> Result<(), SyncError> {
        self.ctx.mc.run(&self.adapter, &self.ctx, stop).await
    }

    async fn start_uws(&self, stop: CancellationToken) -> Result<(), SyncError> {
        self.sync_super_cache(&stop).await?;
        self.ctx.uw.run(&self.adapter, &self.ctx, stop).await
    }

    async fn start_patrol(&self, stop: CancellationToken) -> Result<(), SyncError> {
        if !self.ctx.options.patrol_enabled {
            return Ok(());
        }
        self.sync_super_cache(&stop).await?;
        self.patroller().run(stop).await;
        Ok(())
    }

    async fn add_cluster(&self, cluster: &Arc<TenantCluster>) -> Result<(), SyncError> {
        if self.ctx.options.mode == SyncMode::Ignore {
            return Ok(());
        }
        match self.adapter.profile() {
            SyncProfile::Downward => {
                let ctx = self.ctx.clone();
                let key = cluster.key().clone();
                self.ctx
                    .mc
                    .watch_cluster_resource(cluster, move |event, obj: &A::Object| {
                        ctx.mc.enqueue(SyncRequest::from_object(key.clone(), obj, event));
                    })
                    .await
            }
            SyncProfile::Public => {
                let ctx = self.ctx.clone();
                let key = cluster.key().clone();
                self.ctx
                    .mc
                    .watch_cluster_resource(cluster, move |_event, obj: &A::Object| {
                        // Tenant-side mutations of a mirrored kind get
                        // reconciled back toward the super copy.
                        if let Some(name) = obj.meta().name.clone() {
                            ctx.uw.enqueue(UpwardRequest::new(key.clone(), None, name));
                        }
                    })
                    .await?;
                // Prime every already-published object into the new tenant.
                for p in self.ctx.super_state() {
                    if !delegate::is_public(p.meta()) {
                        continue;
                    }
                    if let Some(name) = p.meta().name.clone() {
                        self.ctx
                            .uw
                            .enqueue(UpwardRequest::new(cluster.key().clone(), None, name));
                    }
                }
                Ok(())
            }
            SyncProfile::UpwardOnly => {
                self.ctx.mc.register_cluster(cluster);
                Ok(())
            }
        }
    }

    async fn remove_cluster(&self, key: &ClusterKey) {
        self.ctx.mc.teardown_cluster_resource(key);
    }
}

/// One registered syncer per kind.
#[derive(Default)]
pub struct SyncerRegistry {
    syncers: Vec<Arc<dyn Syncer>>,
}

impl SyncerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a syncer. Registration order is attach order.
    pub fn register(&mut self, syncer: Arc<dyn Syncer>) {
        self.syncers.push(syncer);
    }

    /// The registered syncers.
    #[must_use]
    pub fn syncers(&self) -> &[Arc<dyn Syncer>] {
        &self.syncers
    }

    /// Spawn the three lifecycle loops of every syncer.
    pub fn spawn(&self, stop: &CancellationToken) -> Vec<JoinHandle<Result<(), SyncError>>> {
        let mut handles = Vec::with_capacity(self.syncers.len() * 3);
        for syncer in &self.syncers {
            for start in [Start::Dws, Start::Uws, Start::Patrol] {
                let syncer = syncer.clone();
                let stop = stop.child_token();
                handles.push(tokio::spawn(async move {
                    match start {
                        Start::Dws => syncer.start_dws(stop).await,
                        Start::Uws => syncer.start_uws(stop).await,
                        Start::Patrol => syncer.start_patrol(stop).await,
                    }
                }));
            }
        }
        handles
    }

    /// Announce a tenant to every syncer; fails on the first refusal.
    pub async fn add_cluster(&self, cluster: &Arc<TenantCluster>) -> Result<(), SyncError> {
        for syncer in &self.syncers {
            syncer.add_cluster(cluster).await?;
        }
        Ok(())
    }

    /// Announce a tenant's departure to every syncer.
    pub async fn remove_cluster(&self, key: &ClusterKey) {
        for syncer in &self.syncers {
            syncer.remove_cluster(key).await;
        }
    }
}

#[derive(Clone, Copy)]
enum Start {
    Dws,
    Uws,
    Patrol,
}
