//! Testing fixtures for the virtual cluster syncer.
//!
//! [`FakeApiServer`] is an in-memory [`ApiBackend`] with the semantics the
//! engine relies on: create/replace/delete with resource versions, UID
//! preconditions, and a watch stream that replays current state before
//! streaming live events. Controller behavior can be exercised against it
//! without an apiserver. [`FakeConnector`] stands in for kubeconfig
//! resolution and hands each descriptor its own fake cluster.

use futures::{stream, StreamExt};
use kube::{
    api::{ApiResource, DynamicObject},
    runtime::watcher,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::broadcast;
use vcsync_core::{VirtualCluster, VirtualClusterSpec};
use vcsync_runtime::{
    api::{from_dynamic, to_dynamic, ApiBackend, ApiError, ObjectApi},
    cluster::ClusterConnector,
    sync::SyncObject,
    SyncError, TenantCluster,
};

#[derive(Clone, Debug)]
enum FakeEvent {
    Apply(DynamicObject),
    Delete(DynamicObject),
}

struct KindState {
    objects: BTreeMap<(Option<String>, String), DynamicObject>,
    sequence: u64,
    events: broadcast::Sender<FakeEvent>,
}

impl KindState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            objects: BTreeMap::new(),
            sequence: 1,
            events,
        }
    }
}

#[derive(Default)]
struct Inner {
    kinds: Mutex<HashMap<String, KindState>>,
    writes: AtomicU64,
}

/// An in-memory API server for one cluster.
///
/// Cloning shares the same state; hand clones out as both the backend and
/// the test's inspection handle.
#[derive(Clone, Default)]
pub struct FakeApiServer {
    inner: Arc<Inner>,
}

impl FakeApiServer {
    /// An empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// This server as an [`ApiBackend`].
    #[must_use]
    pub fn backend(&self) -> Arc<dyn ApiBackend> {
        Arc::new(self.clone())
    }

    /// How many mutating API calls have succeeded so far.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Seed `obj` directly into the store (not counted as a write). Live
    /// watchers observe it as an apply.
    pub fn put<K: SyncObject>(&self, obj: &K) {
        let resource = ApiResource::erase::<K>(&());
        let mut dynamic = to_dynamic(obj, &resource).expect("fixture object must serialize");
        let mut kinds = self.inner.kinds.lock();
        let state = kinds.entry(resource.kind).or_insert_with(KindState::new);
        if dynamic.metadata.uid.is_none() {
            dynamic.metadata.uid = Some(format!("uid-{}", state.sequence));
        }
        if dynamic.metadata.resource_version.is_none() {
            dynamic.metadata.resource_version = Some(state.sequence.to_string());
        }
        state.sequence += 1;
        let name = dynamic.metadata.name.clone().expect("fixture object must be named");
        let key = (dynamic.metadata.namespace.clone(), name);
        state.objects.insert(key, dynamic.clone());
        let _ = state.events.send(FakeEvent::Apply(dynamic));
    }

    /// Remove an object directly (not counted as a write). Live watchers
    /// observe the deletion.
    pub fn remove<K: SyncObject>(&self, namespace: Option<&str>, name: &str) {
        let resource = ApiResource::erase::<K>(&());
        let mut kinds = self.inner.kinds.lock();
        let Some(state) = kinds.get_mut(&resource.kind) else { return };
        if let Some(gone) = state.objects.remove(&(namespace.map(String::from), name.to_string())) {
            let _ = state.events.send(FakeEvent::Delete(gone));
        }
    }

    /// Read one object back in typed form.
    #[must_use]
    pub fn get_as<K: SyncObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let resource = ApiResource::erase::<K>(&());
        let kinds = self.inner.kinds.lock();
        let state = kinds.get(&resource.kind)?;
        let obj = state
            .objects
            .get(&(namespace.map(String::from), name.to_string()))?
            .clone();
        from_dynamic(obj).ok()
    }

    /// Every stored object of a kind, in typed form.
    #[must_use]
    pub fn objects_of<K: SyncObject>(&self) -> Vec<K> {
        let resource = ApiResource::erase::<K>(&());
        let kinds = self.inner.kinds.lock();
        kinds
            .get(&resource.kind)
            .map(|state| {
                state
                    .objects
                    .values()
                    .cloned()
                    .filter_map(|obj| from_dynamic(obj).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ApiBackend for FakeApiServer {
    fn api(&self, resource: &ApiResource) -> Box<dyn ObjectApi> {
        Box::new(FakeApi {
            server: self.clone(),
            kind: resource.kind.clone(),
        })
    }

    fn watch(
        &self,
        resource: &ApiResource,
    ) -> futures::stream::BoxStream<'static, Result<watcher::Event<DynamicObject>, ApiError>> {
        let (snapshot, rx) = {
            let mut kinds = self.inner.kinds.lock();
            let state = kinds
                .entry(resource.kind.clone())
                .or_insert_with(KindState::new);
            (
                state.objects.values().cloned().collect::<Vec<_>>(),
                state.events.subscribe(),
            )
        };
        let replay = stream::iter(
            std::iter::once(Ok(watcher::Event::Init))
                .chain(snapshot.into_iter().map(|obj| Ok(watcher::Event::InitApply(obj))))
                .chain(std::iter::once(Ok(watcher::Event::InitDone))),
        );
        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(FakeEvent::Apply(obj)) => return Some((Ok(watcher::Event::Apply(obj)), rx)),
                    Ok(FakeEvent::Delete(obj)) => return Some((Ok(watcher::Event::Delete(obj)), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        replay.chain(live).boxed()
    }
}

struct FakeApi {
    server: FakeApiServer,
    kind: String,
}

impl FakeApi {
    fn with_state<T>(&self, f: impl FnOnce(&mut KindState) -> T) -> T {
        let mut kinds = self.server.inner.kinds.lock();
        f(kinds.entry(self.kind.clone()).or_insert_with(KindState::new))
    }

    fn record_write(&self) {
        self.server.inner.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn object_key(namespace: Option<&str>, name: &str) -> (Option<String>, String) {
    (namespace.map(String::from), name.to_string())
}

#[async_trait::async_trait]
impl ObjectApi for FakeApi {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, ApiError> {
        Ok(self.with_state(|state| state.objects.get(&object_key(namespace, name)).cloned()))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>, ApiError> {
        Ok(self.with_state(|state| {
            state
                .objects
                .iter()
                .filter(|((ns, _), _)| namespace.is_none() || ns.as_deref() == namespace)
                .map(|(_, obj)| obj.clone())
                .collect()
        }))
    }

    async fn create(&self, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, ApiError> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| ApiError::BadObject("create without a name".to_string()))?;
        let created = self.with_state(|state| {
            let key = object_key(namespace, &name);
            if state.objects.contains_key(&key) {
                return Err(ApiError::AlreadyExists);
            }
            let mut stored = obj.clone();
            stored.metadata.namespace = key.0.clone();
            if stored.metadata.uid.is_none() {
                stored.metadata.uid = Some(format!("uid-{}", state.sequence));
            }
            stored.metadata.resource_version = Some(state.sequence.to_string());
            state.sequence += 1;
            state.objects.insert(key, stored.clone());
            let _ = state.events.send(FakeEvent::Apply(stored.clone()));
            Ok(stored)
        })?;
        self.record_write();
        Ok(created)
    }

    async fn replace(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let replaced = self.with_state(|state| {
            let key = object_key(namespace, name);
            let Some(existing) = state.objects.get(&key) else {
                return Err(ApiError::NotFound);
            };
            if let Some(rv) = &obj.metadata.resource_version {
                if Some(rv) != existing.metadata.resource_version.as_ref() {
                    return Err(ApiError::Conflict);
                }
            }
            let mut stored = obj.clone();
            stored.metadata.namespace = key.0.clone();
            stored.metadata.uid = existing.metadata.uid.clone();
            stored.metadata.resource_version = Some(state.sequence.to_string());
            state.sequence += 1;
            state.objects.insert(key, stored.clone());
            let _ = state.events.send(FakeEvent::Apply(stored.clone()));
            Ok(stored)
        })?;
        self.record_write();
        Ok(replaced)
    }

    async fn replace_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let replaced = self.with_state(|state| {
            let key = object_key(namespace, name);
            let Some(existing) = state.objects.get(&key) else {
                return Err(ApiError::NotFound);
            };
            let mut current = serde_json::to_value(existing)
                .map_err(|err| ApiError::BadObject(err.to_string()))?;
            let incoming =
                serde_json::to_value(obj).map_err(|err| ApiError::BadObject(err.to_string()))?;
            match incoming.get("status") {
                Some(status) => current["status"] = status.clone(),
                None => {
                    if let Some(map) = current.as_object_mut() {
                        map.remove("status");
                    }
                }
            }
            let mut stored: DynamicObject = serde_json::from_value(current)
                .map_err(|err| ApiError::BadObject(err.to_string()))?;
            stored.metadata.resource_version = Some(state.sequence.to_string());
            state.sequence += 1;
            state.objects.insert(key, stored.clone());
            let _ = state.events.send(FakeEvent::Apply(stored.clone()));
            Ok(stored)
        })?;
        self.record_write();
        Ok(replaced)
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        expected_uid: Option<&str>,
    ) -> Result<(), ApiError> {
        self.with_state(|state| {
            let key = object_key(namespace, name);
            let Some(existing) = state.objects.get(&key) else {
                return Err(ApiError::NotFound);
            };
            if let Some(expected) = expected_uid {
                if existing.metadata.uid.as_deref() != Some(expected) {
                    return Err(ApiError::Conflict);
                }
            }
            let gone = state.objects.remove(&key).expect("checked above");
            let _ = state.events.send(FakeEvent::Delete(gone));
            Ok(())
        })?;
        self.record_write();
        Ok(())
    }
}

/// Connector that resolves descriptors to pre-registered fake clusters.
#[derive(Default)]
pub struct FakeConnector {
    tenants: Mutex<HashMap<(String, String), FakeApiServer>>,
}

impl FakeConnector {
    /// An empty connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate the descriptor `namespace/name` with `server`.
    pub fn register(&self, namespace: &str, name: &str, server: FakeApiServer) {
        self.tenants
            .lock()
            .insert((namespace.to_string(), name.to_string()), server);
    }
}

#[async_trait::async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, descriptor: &VirtualCluster) -> Result<Arc<dyn ApiBackend>, SyncError> {
        let namespace = descriptor.metadata.namespace.clone().unwrap_or_default();
        let name = descriptor.metadata.name.clone().unwrap_or_default();
        let server = self
            .tenants
            .lock()
            .get(&(namespace, name.clone()))
            .cloned()
            .ok_or(SyncError::Connect {
                cluster: name,
                message: "no fake cluster registered".to_string(),
            })?;
        Ok(server.backend())
    }
}

/// A persisted-looking descriptor fixture.
#[must_use]
pub fn descriptor(namespace: &str, name: &str, uid: &str) -> VirtualCluster {
    let mut vc = VirtualCluster::new(
        name,
        VirtualClusterSpec {
            cluster_version_ref: "v1".to_string(),
            service_type: Default::default(),
            admin_kubeconfig_secret_ref: format!("{name}-kubeconfig"),
        },
    );
    vc.metadata.namespace = Some(namespace.to_string());
    vc.metadata.uid = Some(uid.to_string());
    vc
}

/// A tenant cluster handle over a fake server, as the manager would build
/// it for `descriptor`.
#[must_use]
pub fn cluster_for(descriptor: &VirtualCluster, server: &FakeApiServer) -> Arc<TenantCluster> {
    let key = descriptor.cluster_key().expect("descriptor fixture must be persisted");
    let owner = descriptor.owner_info().expect("descriptor fixture must be persisted");
    TenantCluster::new(key, owner, descriptor.spec.clone(), server.backend())
}
