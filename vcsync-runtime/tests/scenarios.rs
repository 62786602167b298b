//! End-to-end scenarios over fake clusters: the full pipeline from tenant
//! informers through the queues to super-cluster writes and back.

use k8s_openapi::api::{
    core::v1::{
        Event as CoreEvent, Namespace, ObjectReference, Pod, PodStatus, Service, ServiceAccount,
        ServicePort, ServiceSpec,
    },
    storage::v1::StorageClass,
};
use kube::api::ObjectMeta;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use vcsync_core::{delegate, equality, projection, ClusterKey, Delegate};
use vcsync_runtime::{
    resources::{
        EventAdapter, NamespaceAdapter, ServiceAccountAdapter, ServiceAdapter, StorageClassAdapter,
    },
    sync::Adapter,
    ClusterManager, ResourceSyncer, SuperNamespaceIndex, SyncError, SyncEvent, SyncRequest, Syncer,
    SyncerOptions, SyncerRegistry, TenantCluster, UpwardRequest,
};
use vcsync_test::{cluster_for, descriptor, FakeApiServer, FakeConnector};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn spawn_loops<A: Adapter>(syncer: &Arc<ResourceSyncer<A>>, stop: &CancellationToken) {
    let dws = syncer.clone();
    let token = stop.child_token();
    tokio::spawn(async move { dws.start_dws(token).await });
    let uws = syncer.clone();
    let token = stop.child_token();
    tokio::spawn(async move { uws.start_uws(token).await });
}

struct Harness {
    super_api: FakeApiServer,
    nsindex: Arc<SuperNamespaceIndex>,
    namespaces: Arc<ResourceSyncer<NamespaceAdapter>>,
    service_accounts: Arc<ResourceSyncer<ServiceAccountAdapter>>,
    storage_classes: Arc<ResourceSyncer<StorageClassAdapter>>,
    events: Arc<ResourceSyncer<EventAdapter>>,
    stop: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let super_api = FakeApiServer::new();
        let nsindex = Arc::new(SuperNamespaceIndex::new());
        let options = || SyncerOptions::default().cache_sync_timeout(Duration::from_secs(5));
        Self {
            namespaces: ResourceSyncer::new(
                NamespaceAdapter::new(nsindex.clone()),
                super_api.backend(),
                nsindex.clone(),
                options(),
            ),
            service_accounts: ResourceSyncer::new(
                ServiceAccountAdapter,
                super_api.backend(),
                nsindex.clone(),
                options(),
            ),
            storage_classes: ResourceSyncer::new(
                StorageClassAdapter,
                super_api.backend(),
                nsindex.clone(),
                options(),
            ),
            events: ResourceSyncer::new(EventAdapter, super_api.backend(), nsindex.clone(), options()),
            super_api,
            nsindex,
            stop: CancellationToken::new(),
        }
    }

    async fn start(&self) {
        self.namespaces.sync_super_cache(&self.stop).await.unwrap();
        self.service_accounts.sync_super_cache(&self.stop).await.unwrap();
        self.storage_classes.sync_super_cache(&self.stop).await.unwrap();
        self.events.sync_super_cache(&self.stop).await.unwrap();
        spawn_loops(&self.namespaces, &self.stop);
        spawn_loops(&self.service_accounts, &self.stop);
        spawn_loops(&self.storage_classes, &self.stop);
        spawn_loops(&self.events, &self.stop);
    }

    async fn attach(&self, namespace: &str, name: &str, uid: &str) -> (FakeApiServer, Arc<TenantCluster>, ClusterKey) {
        let tenant = FakeApiServer::new();
        let vc = descriptor(namespace, name, uid);
        let cluster = cluster_for(&vc, &tenant);
        let key = cluster.key().clone();
        self.namespaces.add_cluster(&cluster).await.unwrap();
        self.service_accounts.add_cluster(&cluster).await.unwrap();
        self.storage_classes.add_cluster(&cluster).await.unwrap();
        self.events.add_cluster(&cluster).await.unwrap();
        (tenant, cluster, key)
    }
}

fn namespace_named(name: &str, uid: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

const TENANT_UID: &str = "7374a172-c35d-45b1-9c8e-bf5c5b614937";
const S1_SUPER_NS: &str = "test-tenant-1-7374a172-c35d-45b1-9c8e-bf5c5b614937-default";

#[tokio::test]
async fn s1_create_and_project() {
    let h = Harness::new();
    h.start().await;
    let (tenant, _cluster, key) = h.attach("tenant-1", "test", TENANT_UID).await;

    tenant.put(&namespace_named("default", "12345"));

    eventually("physical namespace", || {
        h.super_api.get_as::<Namespace>(None, S1_SUPER_NS).is_some()
    })
    .await;
    let p = h.super_api.get_as::<Namespace>(None, S1_SUPER_NS).unwrap();
    let found = Delegate::of(&p.metadata).unwrap();
    assert_eq!(found.cluster, key);
    assert_eq!(found.namespace, "default");
    assert_eq!(found.uid, "12345");

    // Deleting the virtual namespace deletes its projection.
    tenant.remove::<Namespace>(None, "default");
    eventually("projection removed", || {
        h.super_api.get_as::<Namespace>(None, S1_SUPER_NS).is_none()
    })
    .await;
}

#[tokio::test]
async fn s2_patrol_collects_orphans() {
    let h = Harness::new();
    h.start().await;
    let (_tenant, _cluster, key) = h.attach("tenant-1", "test", TENANT_UID).await;

    // A stale projection: its uid annotation names an incarnation that no
    // longer exists, and no virtual namespace backs it.
    let mut orphan = namespace_named(S1_SUPER_NS, "p-uid-1");
    Delegate {
        cluster: key.clone(),
        namespace: "default".to_string(),
        uid: "99999".to_string(),
    }
    .stamp(&mut orphan.metadata);
    h.super_api.put(&orphan);

    eventually("orphan visible in super cache", || {
        h.namespaces
            .context()
            .super_object(&projection::Location {
                namespace: None,
                name: S1_SUPER_NS.to_string(),
            })
            .is_some()
    })
    .await;

    let stats = h.namespaces.patroller().patrol_once().await.unwrap();
    assert_eq!(stats.orphans_collected, 1);
    assert!(h.super_api.get_as::<Namespace>(None, S1_SUPER_NS).is_none());
}

#[tokio::test]
async fn s3_public_storage_class_reaches_every_tenant() {
    let h = Harness::new();
    h.start().await;

    let sc = StorageClass {
        metadata: ObjectMeta {
            name: Some("sc".to_string()),
            labels: Some(BTreeMap::from([(
                delegate::PUBLIC.to_string(),
                "true".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        provisioner: "a".to_string(),
        ..StorageClass::default()
    };
    h.super_api.put(&sc);
    eventually("storage class in super cache", || {
        !h.storage_classes.context().super_state().is_empty()
    })
    .await;

    let (tenant_1, _c1, _k1) = h.attach("t", "one", "uid-one").await;
    let (tenant_2, _c2, _k2) = h.attach("t", "two", "uid-two").await;

    for tenant in [&tenant_1, &tenant_2] {
        eventually("storage class mirrored", || {
            tenant
                .get_as::<StorageClass>(None, "sc")
                .is_some_and(|copy| copy.provisioner == "a")
        })
        .await;
    }

    // Super is the source of truth: a provisioner change must reach both
    // tenants on the next reconcile.
    let mut changed = sc.clone();
    changed.provisioner = "b".to_string();
    h.super_api.put(&changed);
    for tenant in [&tenant_1, &tenant_2] {
        eventually("storage class updated", || {
            tenant
                .get_as::<StorageClass>(None, "sc")
                .is_some_and(|copy| copy.provisioner == "b")
        })
        .await;
    }
}

#[tokio::test]
async fn s4_uid_conflict_is_fatal_until_patrol_collects() {
    let h = Harness::new();
    h.start().await;
    let (tenant, _cluster, key) = h.attach("tenant-1", "test", TENANT_UID).await;
    let super_ns = key.super_namespace("default");

    let sa = ServiceAccount {
        metadata: ObjectMeta {
            name: Some("sa-3".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("12345".to_string()),
            ..ObjectMeta::default()
        },
        ..ServiceAccount::default()
    };
    tenant.put(&sa);

    // A projection left over from a previous incarnation of the name.
    let mut stale = ServiceAccount {
        metadata: ObjectMeta {
            name: Some("sa-3".to_string()),
            namespace: Some(super_ns.clone()),
            ..ObjectMeta::default()
        },
        ..ServiceAccount::default()
    };
    Delegate {
        cluster: key.clone(),
        namespace: "default".to_string(),
        uid: "123456".to_string(),
    }
    .stamp(&mut stale.metadata);
    h.super_api.put(&stale);

    let ctx = h.service_accounts.context();
    let adapter = h.service_accounts.adapter();
    eventually("virtual service account cached", || {
        ctx.mc().get(&key, Some("default"), "sa-3").is_some()
    })
    .await;
    eventually("stale projection cached", || {
        ctx.super_object(&projection::Location {
            namespace: Some(super_ns.clone()),
            name: "sa-3".to_string(),
        })
        .is_some()
    })
    .await;

    let request = SyncRequest::new(
        key.clone(),
        Some("default".to_string()),
        "sa-3".to_string(),
        "12345".to_string(),
        SyncEvent::Update,
    );
    let err = adapter.reconcile(ctx, &request).await.unwrap_err();
    assert!(matches!(err, SyncError::DelegationConflict { .. }), "got {err}");

    let stats = h.service_accounts.patroller().patrol_once().await.unwrap();
    assert_eq!(stats.orphans_collected, 1);

    adapter.reconcile(ctx, &request).await.unwrap();
    let p = h
        .super_api
        .get_as::<ServiceAccount>(Some(&super_ns), "sa-3")
        .unwrap();
    assert_eq!(Delegate::of(&p.metadata).unwrap().uid, "12345");
}

#[tokio::test]
async fn s5_events_upsync_with_remapped_references() {
    let h = Harness::new();
    h.start().await;
    let (tenant, _cluster, key) = h.attach("tenant-1", "test", TENANT_UID).await;
    let super_ns = key.super_namespace("default");

    // The tenant object the event should point at after remapping.
    let pod = Pod {
        metadata: ObjectMeta {
            name: Some("pod".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("12345".to_string()),
            ..ObjectMeta::default()
        },
        ..Pod::default()
    };
    tenant.put(&pod);

    // The namespace index learns the super namespace from its delegation
    // annotations.
    let mut p_ns = namespace_named(&super_ns, "ns-uid");
    Delegate {
        cluster: key.clone(),
        namespace: "default".to_string(),
        uid: "ns-uid".to_string(),
    }
    .stamp(&mut p_ns.metadata);
    h.super_api.put(&p_ns);
    eventually("namespace index entry", || h.nsindex.resolve(&super_ns).is_some()).await;

    let event = CoreEvent {
        metadata: ObjectMeta {
            name: Some("event".to_string()),
            namespace: Some(super_ns.clone()),
            ..ObjectMeta::default()
        },
        involved_object: ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some("pod".to_string()),
            namespace: Some(super_ns.clone()),
            uid: Some("23456".to_string()),
            ..ObjectReference::default()
        },
        message: Some("scheduled".to_string()),
        ..CoreEvent::default()
    };
    h.super_api.put(&event);

    eventually("tenant event", || {
        tenant.get_as::<CoreEvent>(Some("default"), "event").is_some()
    })
    .await;
    let copy = tenant.get_as::<CoreEvent>(Some("default"), "event").unwrap();
    assert_eq!(copy.involved_object.uid.as_deref(), Some("12345"));
    assert_eq!(copy.involved_object.namespace.as_deref(), Some("default"));
    assert_eq!(copy.message.as_deref(), Some("scheduled"));
}

#[tokio::test]
async fn s6_detach_stops_watches_and_patrol_collects_projections() {
    let h = Harness::new();
    h.start().await;

    let mut registry = SyncerRegistry::new();
    registry.register(h.namespaces.clone());
    registry.register(h.service_accounts.clone());
    let registry = Arc::new(registry);

    let tenant = FakeApiServer::new();
    let connector = Arc::new(FakeConnector::new());
    connector.register("tenant-1", "test", tenant.clone());
    let manager = ClusterManager::new(h.super_api.backend(), connector, registry);
    {
        let manager = manager.clone();
        let stop = h.stop.child_token();
        tokio::spawn(async move { manager.run(stop).await });
    }

    let vc = descriptor("tenant-1", "test", TENANT_UID);
    let key = vc.cluster_key().unwrap();
    h.super_api.put(&vc);

    eventually("tenant attached", || manager.cluster(&key).is_some()).await;
    // The root namespace is stamped as owned by the whole tenant.
    let root = h.super_api.get_as::<Namespace>(None, key.root_namespace()).unwrap();
    assert!(delegate::is_root_ns(&root.metadata));

    tenant.put(&namespace_named("default", "12345"));
    eventually("projection created", || {
        h.super_api.get_as::<Namespace>(None, S1_SUPER_NS).is_some()
    })
    .await;

    // A second tenant that stays attached, so the patrol has clusters to
    // sweep after the first one goes away.
    let survivor = FakeApiServer::new();
    let survivor_vc = descriptor("tenant-2", "other", "0f61a2b1-58a8-43bd-9f21-d51b4a3012aa");
    let survivor_cluster = cluster_for(&survivor_vc, &survivor);
    h.namespaces.add_cluster(&survivor_cluster).await.unwrap();

    let handle = manager.cluster(&key).unwrap();
    h.super_api.remove::<vcsync_core::VirtualCluster>(Some("tenant-1"), "test");
    eventually("tenant detached", || manager.cluster(&key).is_none()).await;
    assert!(handle.is_torn_down());

    // One patrol period collects everything carrying the cluster key.
    eventually("stale projection cached", || {
        h.namespaces
            .context()
            .super_object(&projection::Location {
                namespace: None,
                name: S1_SUPER_NS.to_string(),
            })
            .is_some()
    })
    .await;
    let stats = h.namespaces.patroller().patrol_once().await.unwrap();
    assert!(stats.orphans_collected >= 2, "got {stats}");
    assert!(h.super_api.get_as::<Namespace>(None, S1_SUPER_NS).is_none());
    assert!(h
        .super_api
        .get_as::<Namespace>(None, key.root_namespace())
        .is_none());

    // Reconciles for the detached cluster exit immediately.
    let request = SyncRequest::new(
        key.clone(),
        None,
        "default".to_string(),
        "12345".to_string(),
        SyncEvent::Delete,
    );
    h.namespaces
        .adapter()
        .reconcile(h.namespaces.context(), &request)
        .await
        .unwrap();
}

#[tokio::test]
async fn uid_preconditions_guard_every_delete() {
    let super_api = FakeApiServer::new();
    super_api.put(&namespace_named("guarded", "uid-live"));
    let api = super_api.backend().api(&kube::api::ApiResource::erase::<Namespace>(&()));

    // A delete whose precondition names a stale uid loses the conflict and
    // leaves the object alone.
    let err = api.delete(None, "guarded", Some("uid-stale")).await.unwrap_err();
    assert!(matches!(err, vcsync_runtime::api::ApiError::Conflict));
    assert!(super_api.get_as::<Namespace>(None, "guarded").is_some());

    api.delete(None, "guarded", Some("uid-live")).await.unwrap();
    assert!(super_api.get_as::<Namespace>(None, "guarded").is_none());
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let h = Harness::new();
    let (tenant, _cluster, key) = {
        let tenant = FakeApiServer::new();
        let vc = descriptor("tenant-1", "test", TENANT_UID);
        let cluster = cluster_for(&vc, &tenant);
        let key = cluster.key().clone();
        h.namespaces.add_cluster(&cluster).await.unwrap();
        (tenant, cluster, key)
    };

    tenant.put(&namespace_named("default", "12345"));
    let ctx = h.namespaces.context();
    eventually("virtual namespace cached", || {
        ctx.mc().get(&key, None, "default").is_some()
    })
    .await;

    let request = SyncRequest::new(
        key.clone(),
        None,
        "default".to_string(),
        "12345".to_string(),
        SyncEvent::Add,
    );
    let adapter = h.namespaces.adapter();
    adapter.reconcile(ctx, &request).await.unwrap();
    let writes = h.super_api.writes();
    assert!(writes > 0);

    // Unchanged inputs must produce zero API writes on the second call.
    adapter.reconcile(ctx, &request).await.unwrap();
    assert_eq!(h.super_api.writes(), writes);
}

#[tokio::test]
async fn patrol_converges_from_arbitrary_state() {
    let h = Harness::new();
    h.start().await;
    let (tenant, _cluster, key) = h.attach("tenant-1", "test", TENANT_UID).await;

    // Let the event-driven path settle two healthy projections first.
    let mut app = namespace_named("app", "u-1");
    app.metadata.labels = Some(BTreeMap::from([("team".to_string(), "a".to_string())]));
    tenant.put(&app);
    let mut drift_v = namespace_named("drift", "u-2");
    drift_v.metadata.labels = Some(BTreeMap::from([("x".to_string(), "1".to_string())]));
    tenant.put(&drift_v);
    eventually("projections settled", || {
        h.super_api.get_as::<Namespace>(None, &key.super_namespace("app")).is_some()
            && h.super_api.get_as::<Namespace>(None, &key.super_namespace("drift")).is_some()
    })
    .await;

    // Now damage the super side directly, where no tenant event will ever
    // repair it: delete one projection, rewrite another, and plant an
    // orphan delegating to a virtual namespace that does not exist.
    h.super_api.remove::<Namespace>(None, &key.super_namespace("app"));
    let mut drift_p = namespace_named(&key.super_namespace("drift"), "p-drift");
    drift_p.metadata.labels = Some(BTreeMap::from([("x".to_string(), "2".to_string())]));
    Delegate {
        cluster: key.clone(),
        namespace: "drift".to_string(),
        uid: "u-2".to_string(),
    }
    .stamp(&mut drift_p.metadata);
    h.super_api.put(&drift_p);
    let mut gone = namespace_named(&key.super_namespace("gone"), "p-gone");
    Delegate {
        cluster: key.clone(),
        namespace: "gone".to_string(),
        uid: "u-9".to_string(),
    }
    .stamp(&mut gone.metadata);
    h.super_api.put(&gone);

    let ctx = h.namespaces.context();
    eventually("super cache reflects the damage", || {
        ctx.super_object(&projection::Location {
            namespace: None,
            name: key.super_namespace("app"),
        })
        .is_none()
            && ctx
                .super_object(&projection::Location {
                    namespace: None,
                    name: key.super_namespace("gone"),
                })
                .is_some()
            && ctx
                .super_object(&projection::Location {
                    namespace: None,
                    name: key.super_namespace("drift"),
                })
                .is_some_and(|p| {
                    p.metadata
                        .labels
                        .as_ref()
                        .is_some_and(|l| l.get("x") == Some(&"2".to_string()))
                })
    })
    .await;

    let stats = h.namespaces.patroller().patrol_once().await.unwrap();
    assert!(stats.spec_mismatches >= 1, "got {stats}");
    assert_eq!(stats.orphans_collected, 1);

    // One sweep plus the reconciles it queued restore every invariant.
    eventually("missing projection created", || {
        h.super_api
            .get_as::<Namespace>(None, &key.super_namespace("app"))
            .is_some_and(|p| {
                p.metadata
                    .labels
                    .as_ref()
                    .is_some_and(|l| l.get("team") == Some(&"a".to_string()))
            })
    })
    .await;
    eventually("drifted projection rewritten", || {
        h.super_api
            .get_as::<Namespace>(None, &key.super_namespace("drift"))
            .is_some_and(|p| {
                p.metadata
                    .labels
                    .as_ref()
                    .is_some_and(|l| l.get("x") == Some(&"1".to_string()))
            })
    })
    .await;
    assert!(h
        .super_api
        .get_as::<Namespace>(None, &key.super_namespace("gone"))
        .is_none());
}

#[tokio::test]
async fn service_addressing_flows_back_to_tenant() {
    init_tracing();
    let super_api = FakeApiServer::new();
    let nsindex = Arc::new(SuperNamespaceIndex::new());
    let services = ResourceSyncer::new(
        ServiceAdapter,
        super_api.backend(),
        nsindex,
        SyncerOptions::default(),
    );
    let stop = CancellationToken::new();
    services.sync_super_cache(&stop).await.unwrap();

    let tenant = FakeApiServer::new();
    let vc = descriptor("tenant-1", "test", TENANT_UID);
    let cluster = cluster_for(&vc, &tenant);
    let key = cluster.key().clone();
    services.add_cluster(&cluster).await.unwrap();

    let v = Service {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("u-1".to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    };
    tenant.put(&v);

    // The physical service with the addressing the super side assigned.
    let mut p = v.clone();
    p.metadata.namespace = Some(key.super_namespace("default"));
    p.metadata.uid = None;
    let p_spec = p.spec.as_mut().unwrap();
    p_spec.cluster_ip = Some("10.96.0.17".to_string());
    p_spec.ports.as_mut().unwrap()[0].node_port = Some(30080);
    Delegate {
        cluster: key.clone(),
        namespace: "default".to_string(),
        uid: "u-1".to_string(),
    }
    .stamp(&mut p.metadata);
    super_api.put(&p);

    let ctx = services.context();
    eventually("caches warm", || {
        ctx.mc().get(&key, Some("default"), "web").is_some()
            && ctx
                .super_object(&projection::Location {
                    namespace: Some(key.super_namespace("default")),
                    name: "web".to_string(),
                })
                .is_some()
    })
    .await;

    let request = UpwardRequest::new(key.clone(), Some("default".to_string()), "web".to_string());
    services.adapter().back_populate(ctx, &request).await.unwrap();

    let updated = tenant.get_as::<Service>(Some("default"), "web").unwrap();
    let spec = updated.spec.unwrap();
    assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.17"));
    assert_eq!(spec.ports.unwrap()[0].node_port, Some(30080));
}

/// A pod adapter local to the tests, exercising the generic upward status
/// path that the shipped adapters opt out of.
struct PodAdapter;

impl Adapter for PodAdapter {
    type Object = Pod;

    fn name(&self) -> &'static str {
        "pod"
    }

    fn project(
        &self,
        delegate: &Delegate,
        location: &projection::Location,
        v: &Pod,
    ) -> Result<Pod, SyncError> {
        Ok(Pod {
            metadata: projection::projected_meta(&v.metadata, delegate, location.clone()),
            spec: v.spec.clone(),
            status: None,
        })
    }

    fn downward_equal(&self, projected: &Pod, p: &Pod) -> bool {
        equality::meta_equal(&projected.metadata, &p.metadata)
            && equality::values_equal(&projected.spec, &p.spec)
    }
}

#[tokio::test]
async fn upward_status_flows_to_tenant() {
    let super_api = FakeApiServer::new();
    let nsindex = Arc::new(SuperNamespaceIndex::new());
    let pods = ResourceSyncer::new(PodAdapter, super_api.backend(), nsindex, SyncerOptions::default());
    let stop = CancellationToken::new();
    pods.sync_super_cache(&stop).await.unwrap();

    let tenant = FakeApiServer::new();
    let vc = descriptor("tenant-1", "test", TENANT_UID);
    let cluster = cluster_for(&vc, &tenant);
    let key = cluster.key().clone();
    pods.add_cluster(&cluster).await.unwrap();

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("u-1".to_string()),
            ..ObjectMeta::default()
        },
        ..Pod::default()
    };
    tenant.put(&pod);

    let mut projection_with_status = Pod {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some(key.super_namespace("default")),
            ..ObjectMeta::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..PodStatus::default()
        }),
        ..Pod::default()
    };
    Delegate {
        cluster: key.clone(),
        namespace: "default".to_string(),
        uid: "u-1".to_string(),
    }
    .stamp(&mut projection_with_status.metadata);
    super_api.put(&projection_with_status);

    let ctx = pods.context();
    eventually("caches warm", || {
        ctx.mc().get(&key, Some("default"), "web").is_some()
            && ctx
                .super_object(&projection::Location {
                    namespace: Some(key.super_namespace("default")),
                    name: "web".to_string(),
                })
                .is_some()
    })
    .await;

    let request = UpwardRequest::new(key.clone(), Some("default".to_string()), "web".to_string());
    pods.adapter().back_populate(ctx, &request).await.unwrap();

    let updated = tenant.get_as::<Pod>(Some("default"), "web").unwrap();
    assert_eq!(
        updated.status.and_then(|status| status.phase).as_deref(),
        Some("Running")
    );
}
