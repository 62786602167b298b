//! Core types and object mapping rules for the virtual cluster syncer.
//!
//! This crate is the pure data layer shared by every syncer component: the
//! tenant identity and naming contract ([`ClusterKey`]), the delegation
//! annotations stamped on every managed super-cluster object ([`Delegate`]),
//! the `VirtualCluster` tenant descriptor resource, and the projection and
//! equality rules that decide what a physical object should look like and
//! whether it has drifted. It performs no I/O.

pub mod cluster_key;
pub use cluster_key::ClusterKey;

pub mod delegate;
pub use delegate::Delegate;

pub mod descriptor;
pub use descriptor::{
    DescriptorCondition, OwnerInfo, VirtualCluster, VirtualClusterSpec, VirtualClusterStatus,
};

pub mod projection;

pub mod equality;
