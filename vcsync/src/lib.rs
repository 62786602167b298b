//! Multi-tenant Kubernetes object synchronization.
//!
//! `vcsync` projects tenant-cluster ("virtual") API objects onto a shared
//! super cluster and reflects selected super-cluster state back into
//! tenants. Each synced kind runs a pipeline of three cooperating loops
//! (downward sync, upward sync, and a periodic patrol that repairs drift
//! and collects orphans) over per-tenant informer caches, with a cluster
//! lifecycle manager attaching and detaching tenants as their descriptors
//! come and go.
//!
//! The building blocks live in two layers, re-exported here:
//!
//! - [`core`]: cluster keys, delegation annotations, the `VirtualCluster`
//!   descriptor, projection and equality rules.
//! - [`runtime`]: the queues, controllers, patroller, adapters and the
//!   lifecycle manager.
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use vcsync::runtime::{
//!     api::KubeBackend, resources::NamespaceAdapter, ClusterManager, KubeConnector,
//!     ResourceSyncer, SuperNamespaceIndex, SyncerOptions, SyncerRegistry,
//! };
//!
//! # async fn wire() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let super_backend = Arc::new(KubeBackend::new(client));
//! let nsindex = Arc::new(SuperNamespaceIndex::new());
//!
//! let mut registry = SyncerRegistry::new();
//! registry.register(ResourceSyncer::new(
//!     NamespaceAdapter::new(nsindex.clone()),
//!     super_backend.clone(),
//!     nsindex.clone(),
//!     SyncerOptions::default(),
//! ));
//! let registry = Arc::new(registry);
//!
//! let stop = CancellationToken::new();
//! registry.spawn(&stop);
//! let connector = Arc::new(KubeConnector::new(super_backend.clone()));
//! let manager = ClusterManager::new(super_backend, connector, registry);
//! manager.run(stop).await?;
//! # Ok(())
//! # }
//! ```

pub use vcsync_core as core;
pub use vcsync_runtime as runtime;

pub use vcsync_core::{ClusterKey, Delegate, OwnerInfo, VirtualCluster, VirtualClusterSpec};
pub use vcsync_runtime::{
    Adapter, ClusterManager, ResourceSyncer, SyncError, SyncMode, Syncer, SyncerOptions,
    SyncerRegistry, TenantCluster,
};
