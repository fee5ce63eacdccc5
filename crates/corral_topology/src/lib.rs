//! Topology data model and metadata store for Corral.
//!
//! - [`model`] — clusters, cluster sets, member instances and replication
//!   channels as closed enums and plain structs. The role/state sets are
//!   fixed and finite; everything matches exhaustively.
//! - [`gtid`] — [`gtid::AppliedSet`], the per-source interval set used as
//!   a logical clock over applied transactions.
//! - [`store`] — the versioned, optimistically-checked metadata record:
//!   read a `(TopologySnapshot, MetadataVersion)`, stage deltas in a
//!   [`store::MetadataTxn`], commit only if the version is unchanged.
//!
//! The metadata store is advisory until confirmed by a live probe; the
//! orchestrator never declares success on metadata alone.

pub mod gtid;
pub mod model;
pub mod store;

pub use gtid::{AppliedSet, HistoryRelation};
pub use model::{
    Cluster, ClusterRole, ClusterSet, Instance, InstanceRole, InstanceState, ReplicationChannel,
    TopologyMode,
};
pub use store::{
    InMemoryMetadataStore, MetadataStore, MetadataTxn, MetadataVersion, TopologyDelta,
    TopologySnapshot,
};
