//! The patroller: periodic reconciliation that repairs drift and collects
//! orphans.
//!
//! Event-driven sync can miss changes across informer restarts; the patrol
//! sweep is the forcing function that restores the syncer's invariants
//! regardless. It reads exclusively from caches so that it stays cheap
//! enough to run every minute over thousands of objects, and it repairs by
//! requeueing into the downward or upward queue rather than writing
//! directly. Only orphan collection writes: physical objects whose virtual
//! counterpart (or whole tenant) is gone are deleted under UID
//! preconditions.

use crate::{
    api::ApiError,
    downward::SyncEvent,
    error::SyncError,
    sync::{Adapter, SyncMode, SyncObject, SyncerContext},
    upward::UpwardRequest,
};
use futures::future;
use kube::Resource;
use std::fmt::{self, Display};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vcsync_core::{delegate, equality, Delegate};

/// Counters published after every sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatrolStats {
    /// Virtual objects whose downward projection diverged.
    pub spec_mismatches: u64,
    /// Objects whose status sections diverged.
    pub status_mismatches: u64,
    /// Objects whose upward-flowing metadata diverged.
    pub meta_mismatches: u64,
    /// Physical objects deleted as orphans.
    pub orphans_collected: u64,
}

impl PatrolStats {
    fn absorb(&mut self, other: PatrolStats) {
        self.spec_mismatches += other.spec_mismatches;
        self.status_mismatches += other.status_mismatches;
        self.meta_mismatches += other.meta_mismatches;
        self.orphans_collected += other.orphans_collected;
    }
}

impl Display for PatrolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spec={} status={} meta={} orphans={}",
            self.spec_mismatches, self.status_mismatches, self.meta_mismatches, self.orphans_collected
        )
    }
}

/// Periodic runner around an adapter's patrol body.
pub struct Patroller<A: Adapter> {
    adapter: Arc<A>,
    ctx: Arc<SyncerContext<A::Object>>,
}

impl<A: Adapter> Patroller<A> {
    pub(crate) fn new(adapter: Arc<A>, ctx: Arc<SyncerContext<A::Object>>) -> Self {
        Self { adapter, ctx }
    }

    /// Run one sweep immediately.
    pub async fn patrol_once(&self) -> Result<PatrolStats, SyncError> {
        self.adapter.patrol(&self.ctx).await
    }

    /// Sweep at the configured period until `stop` is cancelled.
    pub async fn run(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.options().patrol_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    match self.patrol_once().await {
                        Ok(stats) => info!(kind = %self.adapter.name(), %stats, "patrol sweep finished"),
                        Err(error) => warn!(kind = %self.adapter.name(), %error, "patrol sweep failed"),
                    }
                }
            }
        }
    }
}

/// The standard sweep for managed kinds.
pub async fn sweep<A: Adapter>(
    ctx: &SyncerContext<A::Object>,
    adapter: &A,
) -> Result<PatrolStats, SyncError> {
    let clusters = ctx.mc().cluster_keys();
    if clusters.is_empty() {
        return Ok(PatrolStats::default());
    }
    let mut stats = PatrolStats::default();

    // Tenant-side pass: every virtual object must have a faithful physical
    // projection. Clusters are scanned in parallel.
    let per_cluster = future::join_all(
        clusters
            .iter()
            .map(|key| sweep_cluster(ctx, adapter, key.clone())),
    )
    .await;
    for cluster_stats in per_cluster {
        stats.absorb(cluster_stats);
    }

    // Super-side pass: every physical object must still be wanted.
    for p in ctx.super_state() {
        let Some(found) = Delegate::of(p.meta()) else { continue };
        // Containment: a projection must live inside its owner's namespace
        // slice. Anything else is mislabelled and not ours to collect.
        let slice = p.meta().namespace.as_deref().or(p.meta().name.as_deref());
        if !slice.is_some_and(|ns| found.cluster.owns_namespace(ns)) {
            warn!(object = ?p.meta().name, cluster = %found.cluster, "object delegates outside its namespace slice");
            continue;
        }
        if delegate::is_root_ns(p.meta()) {
            // Owned by the whole tenant; collected only with its descriptor.
            let live = ctx
                .mc()
                .owner_info(&found.cluster)
                .is_some_and(|owner| owner.uid == found.uid);
            if !live {
                stats.orphans_collected += collect(ctx, &p).await;
            }
            continue;
        }
        if ctx.options().mode == SyncMode::Remove || !ctx.mc().has_cluster(&found.cluster) {
            stats.orphans_collected += collect(ctx, &p).await;
            continue;
        }
        let target = adapter.upward_request(&found, &p);
        match ctx
            .mc()
            .get(&target.cluster, target.namespace.as_deref(), &target.name)
        {
            None => {
                stats.orphans_collected += collect(ctx, &p).await;
            }
            Some(v) => {
                let v_uid = v.meta().uid.as_deref().unwrap_or_default();
                if v_uid != found.uid {
                    // The annotations identify an incarnation that no longer
                    // exists; the live object is resynced once the stale
                    // projection is gone.
                    warn!(object = %target, expected = v_uid, found = %found.uid, "collecting stale projection");
                    stats.orphans_collected += collect(ctx, &p).await;
                }
            }
        }
    }

    Ok(stats)
}

async fn sweep_cluster<A: Adapter>(
    ctx: &SyncerContext<A::Object>,
    adapter: &A,
    key: vcsync_core::ClusterKey,
) -> PatrolStats {
    let mut stats = PatrolStats::default();
    for v in ctx.mc().list(&key) {
        if adapter.excluded(&v) {
            continue;
        }
        let Some(name) = v.meta().name.clone() else { continue };
        let namespace = v.meta().namespace.clone();
        let location = adapter.location(&key, namespace.as_deref(), &name);
        let Some(p) = ctx.super_object(&location) else {
            ctx.mc().requeue_object(&key, &v, SyncEvent::Add);
            continue;
        };
        let Some(found) = Delegate::of(p.meta()) else {
            warn!(object = %location.name, "unmanaged object at expected projection location");
            continue;
        };
        let v_uid = v.meta().uid.as_deref().unwrap_or_default();
        if found.uid != v_uid {
            warn!(object = %location.name, expected = v_uid, found = %found.uid, "delegation uid mismatch");
            continue;
        }
        let tenant_ns = adapter.tenant_namespace(namespace.as_deref(), &name);
        let delegate = Delegate {
            cluster: key.clone(),
            namespace: tenant_ns.to_string(),
            uid: v_uid.to_string(),
        };
        let projected = match adapter.project(&delegate, &location, &v) {
            Ok(projected) => projected,
            Err(error) => {
                warn!(object = %location.name, %error, "failed to build projection during patrol");
                continue;
            }
        };
        if !adapter.downward_equal(&projected, &p) {
            stats.spec_mismatches += 1;
            ctx.mc().requeue_object(&key, &v, SyncEvent::Update);
        } else if adapter.sync_status() && !equality::status_equal(&*v, &*p) {
            stats.status_mismatches += 1;
            ctx.enqueue_upward(adapter.upward_request(&delegate, &p));
        } else {
            let policy = adapter.upward_meta();
            let meta_drift = !equality::changed_keys(
                policy.labels,
                p.meta().labels.as_ref(),
                v.meta().labels.as_ref(),
            )
            .is_empty()
                || !equality::changed_keys(
                    policy.annotations,
                    p.meta().annotations.as_ref(),
                    v.meta().annotations.as_ref(),
                )
                .is_empty();
            if meta_drift {
                stats.meta_mismatches += 1;
                ctx.enqueue_upward(adapter.upward_request(&delegate, &p));
            }
        }
    }
    stats
}

/// Delete one orphaned physical object under a UID precondition. Returns
/// how many objects were actually removed.
async fn collect<K: SyncObject>(ctx: &SyncerContext<K>, p: &K) -> u64 {
    let namespace = p.meta().namespace.clone();
    let Some(name) = p.meta().name.clone() else { return 0 };
    match ctx
        .super_api()
        .delete(namespace.as_deref(), &name, p.meta().uid.as_deref())
        .await
    {
        Ok(()) => {
            debug!(object = %name, "collected orphaned physical object");
            1
        }
        Err(ApiError::NotFound | ApiError::Conflict) => 0,
        Err(error) => {
            warn!(object = %name, %error, "failed to collect orphan");
            0
        }
    }
}

/// The sweep for public kinds: every public super object must exist in
/// every attached tenant with the same spec, and tenant copies of retired
/// public objects must go away.
pub async fn sweep_public<A: Adapter>(
    ctx: &SyncerContext<A::Object>,
    adapter: &A,
) -> Result<PatrolStats, SyncError> {
    let clusters = ctx.mc().cluster_keys();
    if clusters.is_empty() {
        return Ok(PatrolStats::default());
    }
    let mut stats = PatrolStats::default();
    let published: Vec<_> = ctx
        .super_state()
        .into_iter()
        .filter(|p| delegate::is_public(p.meta()))
        .collect();

    for key in &clusters {
        // Copies the tenant should have, up to date.
        for p in &published {
            let Some(name) = p.meta().name.clone() else { continue };
            let desired = match adapter.project_public(p) {
                Ok(desired) => desired,
                Err(error) => {
                    warn!(object = %name, %error, "failed to build public projection");
                    continue;
                }
            };
            let matches = ctx
                .mc()
                .get(key, None, &name)
                .is_some_and(|copy| adapter.downward_equal(&desired, &copy));
            if !matches {
                stats.spec_mismatches += 1;
                ctx.enqueue_upward(UpwardRequest::new(key.clone(), None, name));
            }
        }
        // Copies the tenant should no longer have.
        for copy in ctx.mc().list(key) {
            let Some(name) = copy.meta().name.clone() else { continue };
            let still_published = published
                .iter()
                .any(|p| p.meta().name.as_deref() == Some(name.as_str()));
            if !still_published {
                stats.orphans_collected += 1;
                ctx.enqueue_upward(UpwardRequest::new(key.clone(), None, name));
            }
        }
    }
    Ok(stats)
}
