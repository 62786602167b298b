//! The per-tenant cluster handle and the informer plumbing built on it.
//!
//! A [`TenantCluster`] owns one tenant's API access and the cancellation
//! root for everything started on its behalf. Watches are spawned per kind
//! by the multi-cluster controller; tearing the handle down cancels them
//! all and lets outstanding reconciles for the cluster exit early.

use crate::{
    api::{ApiBackend, KubeBackend, TypedApi},
    downward::SyncEvent,
    error::SyncError,
    sync::SyncObject,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{ApiResource, DynamicObject},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        reflector::{self, Store},
        watcher,
    },
    Client, Config,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use vcsync_core::{ClusterKey, OwnerInfo, VirtualCluster, VirtualClusterSpec};

/// One attached tenant cluster.
pub struct TenantCluster {
    key: ClusterKey,
    owner: OwnerInfo,
    spec: VirtualClusterSpec,
    backend: Arc<dyn ApiBackend>,
    shutdown: CancellationToken,
}

impl TenantCluster {
    /// Build a handle around a connected backend.
    #[must_use]
    pub fn new(
        key: ClusterKey,
        owner: OwnerInfo,
        spec: VirtualClusterSpec,
        backend: Arc<dyn ApiBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            owner,
            spec,
            backend,
            shutdown: CancellationToken::new(),
        })
    }

    /// The tenant's cluster key.
    #[must_use]
    pub fn key(&self) -> &ClusterKey {
        &self.key
    }

    /// Identity of the owning descriptor.
    #[must_use]
    pub fn owner_info(&self) -> &OwnerInfo {
        &self.owner
    }

    /// Snapshot of the descriptor spec the handle was built from.
    #[must_use]
    pub fn spec(&self) -> &VirtualClusterSpec {
        &self.spec
    }

    /// The tenant's API backend.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn ApiBackend> {
        self.backend.clone()
    }

    /// Typed API handle for `K` on this tenant.
    #[must_use]
    pub fn api<K: SyncObject>(&self) -> TypedApi<K> {
        TypedApi::new(&*self.backend)
    }

    /// A token that is cancelled when the cluster is torn down. Everything
    /// started for this cluster hangs off a child of it.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Stop every informer and outstanding reconcile for this cluster.
    pub fn teardown(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`TenantCluster::teardown`] has been called.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Spawn a cache-filling watch for `resource`, delivering typed events to
/// `handler` as they are applied to the returned store.
///
/// The task ends when `stop` is cancelled. Readiness is observed through
/// [`Store::wait_until_ready`]; callers enforce their own deadline on it.
pub(crate) fn spawn_informer<K: SyncObject>(
    backend: Arc<dyn ApiBackend>,
    resource: ApiResource,
    stop: CancellationToken,
    mut handler: impl FnMut(SyncEvent, &K) + Send + 'static,
) -> Store<K> {
    let (reader, mut writer) = reflector::store();
    tokio::spawn(async move {
        let stream = backend.watch(&resource).take_until(stop.cancelled_owned());
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(raw) => {
                    let Some(typed) = parse_event::<K>(raw) else { continue };
                    writer.apply_watcher_event(&typed);
                    match &typed {
                        watcher::Event::InitApply(obj) => handler(SyncEvent::Add, obj),
                        watcher::Event::Apply(obj) => handler(SyncEvent::Update, obj),
                        watcher::Event::Delete(obj) => handler(SyncEvent::Delete, obj),
                        watcher::Event::Init | watcher::Event::InitDone => {}
                    }
                }
                Err(err) => warn!(error = %err, "watch stream error"),
            }
        }
        debug!(kind = %resource.kind, "informer stopped");
    });
    reader
}

fn parse_event<K: SyncObject>(event: watcher::Event<DynamicObject>) -> Option<watcher::Event<K>> {
    let parse = |obj: DynamicObject| match obj.try_parse::<K>() {
        Ok(typed) => Some(typed),
        Err(err) => {
            error!(error = %err, "dropping undecodable watch event");
            None
        }
    };
    match event {
        watcher::Event::Init => Some(watcher::Event::Init),
        watcher::Event::InitDone => Some(watcher::Event::InitDone),
        watcher::Event::InitApply(obj) => parse(obj).map(watcher::Event::InitApply),
        watcher::Event::Apply(obj) => parse(obj).map(watcher::Event::Apply),
        watcher::Event::Delete(obj) => parse(obj).map(watcher::Event::Delete),
    }
}

/// Builds the API backend for a tenant out of its descriptor.
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the tenant described by `descriptor`.
    async fn connect(&self, descriptor: &VirtualCluster) -> Result<Arc<dyn ApiBackend>, SyncError>;
}

/// Production connector: reads the admin kubeconfig secret referenced by
/// the descriptor and builds a client from it.
pub struct KubeConnector {
    super_backend: Arc<dyn ApiBackend>,
}

/// Secret keys probed for the admin kubeconfig payload, in order.
const KUBECONFIG_KEYS: [&str; 3] = ["admin-kubeconfig", "kubeconfig", "config"];

impl KubeConnector {
    /// Build a connector that resolves secrets through `super_backend`.
    #[must_use]
    pub fn new(super_backend: Arc<dyn ApiBackend>) -> Self {
        Self { super_backend }
    }
}

#[async_trait::async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, descriptor: &VirtualCluster) -> Result<Arc<dyn ApiBackend>, SyncError> {
        let name = descriptor.metadata.name.as_deref().unwrap_or_default().to_string();
        let namespace = descriptor.metadata.namespace.as_deref().unwrap_or_default();
        let connect_err = |message: String| SyncError::Connect {
            cluster: name.clone(),
            message,
        };

        let secrets: TypedApi<Secret> = TypedApi::new(&*self.super_backend);
        let secret = secrets
            .get(Some(namespace), &descriptor.spec.admin_kubeconfig_secret_ref)
            .await?
            .ok_or_else(|| connect_err("admin kubeconfig secret not found".to_string()))?;
        let data = secret.data.unwrap_or_default();
        let payload = KUBECONFIG_KEYS
            .iter()
            .find_map(|key| data.get(*key))
            .ok_or_else(|| connect_err("admin kubeconfig secret has no kubeconfig key".to_string()))?;
        let yaml = std::str::from_utf8(&payload.0)
            .map_err(|err| connect_err(format!("kubeconfig is not utf-8: {err}")))?;

        let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|err| connect_err(err.to_string()))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|err| connect_err(err.to_string()))?;
        let client = Client::try_from(config).map_err(|err| connect_err(err.to_string()))?;
        Ok(Arc::new(KubeBackend::new(client)))
    }
}
