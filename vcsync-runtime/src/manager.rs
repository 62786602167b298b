//! The cluster lifecycle manager: watches tenant descriptors and attaches
//! or detaches tenants on every registered syncer.
//!
//! A single-worker queue serializes descriptor transitions so that a
//! flapping tenant cannot interleave attach and detach. The manager is the
//! only writer of the tenant registry; everything else reads it through the
//! per-kind controllers.

use crate::{
    api::{ApiBackend, ApiError, TypedApi},
    cluster::{spawn_informer, ClusterConnector, TenantCluster},
    downward::SyncEvent,
    error::SyncError,
    queue::{run_queue, QueueItem, RetryPolicy, ScheduleRequest},
    sync::SyncerRegistry,
};
use educe::Educe;
use futures::channel::mpsc;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{ApiResource, ObjectMeta},
    runtime::reflector::{ObjectRef, Store},
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::OnceCell,
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vcsync_core::{
    delegate, ClusterKey, Delegate, DescriptorCondition, VirtualCluster, VirtualClusterStatus,
};

/// Work item naming one descriptor.
#[derive(Educe, Clone, Debug)]
#[educe(PartialEq, Eq, Hash)]
pub struct DescriptorRef {
    /// Descriptor namespace.
    pub namespace: String,
    /// Descriptor name.
    pub name: String,
    /// Failed executions so far.
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub attempts: u32,
    /// When this item first failed.
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub first_failure: Option<Instant>,
}

impl DescriptorRef {
    /// A fresh work item.
    #[must_use]
    pub fn new(namespace: String, name: String) -> Self {
        Self {
            namespace,
            name,
            attempts: 0,
            first_failure: None,
        }
    }
}

impl Display for DescriptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl QueueItem for DescriptorRef {
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

/// Watches `VirtualCluster` descriptors and drives tenant attach/detach.
pub struct ClusterManager {
    super_backend: Arc<dyn ApiBackend>,
    connector: Arc<dyn ClusterConnector>,
    registry: Arc<SyncerRegistry>,
    retry: RetryPolicy,
    cache_sync_timeout: Duration,
    clusters: RwLock<HashMap<ClusterKey, Arc<TenantCluster>>>,
    descriptors: OnceCell<Store<VirtualCluster>>,
    tx: mpsc::UnboundedSender<ScheduleRequest<DescriptorRef>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ScheduleRequest<DescriptorRef>>>>,
}

impl ClusterManager {
    /// Build a manager over `registry`, connecting tenants via `connector`.
    #[must_use]
    pub fn new(
        super_backend: Arc<dyn ApiBackend>,
        connector: Arc<dyn ClusterConnector>,
        registry: Arc<SyncerRegistry>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded();
        Arc::new(Self {
            super_backend,
            connector,
            registry,
            retry: RetryPolicy::default(),
            cache_sync_timeout: Duration::from_secs(30),
            clusters: RwLock::new(HashMap::new()),
            descriptors: OnceCell::new(),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Snapshot of attached cluster keys.
    #[must_use]
    pub fn clusters(&self) -> Vec<ClusterKey> {
        self.clusters.read().keys().cloned().collect()
    }

    /// The attached handle for `key`.
    #[must_use]
    pub fn cluster(&self, key: &ClusterKey) -> Option<Arc<TenantCluster>> {
        self.clusters.read().get(key).cloned()
    }

    /// Queue a descriptor transition.
    pub fn enqueue(&self, descriptor: DescriptorRef) {
        let _ = self.tx.unbounded_send(ScheduleRequest::now(descriptor));
    }

    /// Watch descriptors and serialize attach/detach until `stop` fires.
    pub async fn run(self: &Arc<Self>, stop: CancellationToken) -> Result<(), SyncError> {
        self.descriptors
            .get_or_try_init(|| {
                let manager = self.clone();
                let watch_stop = stop.child_token();
                async move {
                    let store = spawn_informer::<VirtualCluster>(
                        manager.super_backend.clone(),
                        ApiResource::erase::<VirtualCluster>(&()),
                        watch_stop.clone(),
                        {
                            let manager = manager.clone();
                            move |_event: SyncEvent, vc: &VirtualCluster| {
                                let namespace = vc.metadata.namespace.clone().unwrap_or_default();
                                let name = vc.metadata.name.clone().unwrap_or_default();
                                manager.enqueue(DescriptorRef::new(namespace, name));
                            }
                        },
                    );
                    match timeout(manager.cache_sync_timeout, store.wait_until_ready()).await {
                        Ok(Ok(())) => Ok(store),
                        _ => {
                            watch_stop.cancel();
                            Err(SyncError::CacheSync {
                                reference: "super/VirtualCluster".to_string(),
                            })
                        }
                    }
                }
            })
            .await?;

        let Some(rx) = self.rx.lock().take() else {
            warn!("cluster manager already running");
            return Ok(());
        };
        let manager = self.clone();
        // One worker: attach/detach transitions must not interleave.
        run_queue(rx, 1, self.retry.clone(), stop, move |descriptor| {
            let manager = manager.clone();
            let descriptor = descriptor.clone();
            Box::pin(async move { manager.reconcile_descriptor(&descriptor).await })
        })
        .await;
        Ok(())
    }

    /// Converge the attach state of one descriptor.
    pub async fn reconcile_descriptor(&self, descriptor: &DescriptorRef) -> Result<(), SyncError> {
        let desired = self.descriptors.get().and_then(|store| {
            store.get(&ObjectRef::new(&descriptor.name).within(&descriptor.namespace))
        });
        match desired {
            None => {
                self.detach_matching(descriptor, None).await;
                Ok(())
            }
            Some(vc) => {
                let Some(key) = vc.cluster_key() else {
                    return Ok(());
                };
                // A flapped descriptor keeps its coordinates but changes
                // uid; the stale attachment goes first.
                self.detach_matching(descriptor, Some(&key)).await;
                if self.clusters.read().contains_key(&key) {
                    return Ok(());
                }
                match self.attach(&vc, &key).await {
                    Ok(()) => {
                        info!(cluster = %key, "tenant attached");
                        self.record_readiness(&vc, true, "Attached", "all syncers watching").await;
                        Ok(())
                    }
                    Err(error) => {
                        self.record_readiness(&vc, false, "AttachFailed", &error.to_string()).await;
                        Err(error)
                    }
                }
            }
        }
    }

    async fn attach(&self, vc: &VirtualCluster, key: &ClusterKey) -> Result<(), SyncError> {
        let owner = vc
            .owner_info()
            .ok_or_else(|| SyncError::Adapter("descriptor has no identity".to_string()))?;
        let backend = self.connector.connect(vc).await?;
        let cluster = TenantCluster::new(key.clone(), owner, vc.spec.clone(), backend);
        self.ensure_root_namespace(&cluster).await?;
        if let Err(error) = self.registry.add_cluster(&cluster).await {
            // Roll the partial attach back; the queue retries the item.
            self.registry.remove_cluster(key).await;
            cluster.teardown();
            return Err(error);
        }
        self.clusters.write().insert(key.clone(), cluster);
        Ok(())
    }

    async fn detach_matching(&self, descriptor: &DescriptorRef, keep: Option<&ClusterKey>) {
        let stale: Vec<ClusterKey> = self
            .clusters
            .read()
            .iter()
            .filter(|(key, cluster)| {
                let owner = cluster.owner_info();
                owner.name == descriptor.name
                    && owner.namespace == descriptor.namespace
                    && keep != Some(*key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.detach(&key).await;
        }
    }

    async fn detach(&self, key: &ClusterKey) {
        let Some(cluster) = self.clusters.write().remove(key) else {
            return;
        };
        self.registry.remove_cluster(key).await;
        cluster.teardown();
        info!(cluster = %key, "tenant detached");
    }

    /// Create the tenant's root namespace on the super cluster: owned by the
    /// whole tenant and collected only with its descriptor.
    async fn ensure_root_namespace(&self, cluster: &Arc<TenantCluster>) -> Result<(), SyncError> {
        let api: TypedApi<Namespace> = TypedApi::new(&*self.super_backend);
        let name = cluster.key().root_namespace();
        if api.get(None, name).await?.is_some() {
            return Ok(());
        }
        let mut meta = ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        };
        Delegate {
            cluster: cluster.key().clone(),
            namespace: String::new(),
            uid: cluster.owner_info().uid.clone(),
        }
        .stamp(&mut meta);
        meta.annotations
            .get_or_insert_with(Default::default)
            .insert(delegate::ROOT_NS.to_string(), "true".to_string());
        let root = Namespace {
            metadata: meta,
            ..Namespace::default()
        };
        match api.create(None, &root).await {
            Ok(_) | Err(ApiError::AlreadyExists) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Record attach readiness on the descriptor status. Best effort: a
    /// failed status write never fails the transition itself.
    async fn record_readiness(&self, vc: &VirtualCluster, ready: bool, reason: &str, message: &str) {
        let (Some(namespace), Some(name)) = (vc.metadata.namespace.as_deref(), vc.metadata.name.as_deref())
        else {
            return;
        };
        let api: TypedApi<VirtualCluster> = TypedApi::new(&*self.super_backend);
        let fresh = match api.get(Some(namespace), name).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "failed to read descriptor for status update");
                return;
            }
        };
        let mut updated = fresh.clone();
        let status = updated.status.get_or_insert_with(VirtualClusterStatus::default);
        status.phase = Some(if ready { "Running" } else { "Pending" }.to_string());
        set_condition(
            status,
            DescriptorCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
                last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            },
        );
        if updated.status == fresh.status {
            return;
        }
        if let Err(error) = api.replace_status(Some(namespace), name, &updated).await {
            warn!(%error, "failed to update descriptor status");
        }
    }
}

fn set_condition(status: &mut VirtualClusterStatus, condition: DescriptorCondition) {
    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.type_ == condition.type_)
    {
        // Keep the original transition time while the value is unchanged.
        if existing.status == condition.status {
            existing.reason = condition.reason;
            existing.message = condition.message;
        } else {
            *existing = condition;
        }
    } else {
        status.conditions.push(condition);
    }
}
