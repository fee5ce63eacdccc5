//! Topology entities: instances, clusters, cluster sets and replication
//! channels.
//!
//! Roles and states are closed enums matched exhaustively: the state set
//! is fixed and finite, so per-instance behavior branches on tagged
//! variants rather than an open hierarchy.

use std::fmt;

use serde::{Deserialize, Serialize};

use corral_common::types::{
    ChannelName, ClusterId, ClusterSetId, CredentialRef, Endpoint, InstanceId,
};
use corral_common::{CorralError, CorralResult};

use crate::gtid::AppliedSet;

// ── Instance ────────────────────────────────────────────────────────────────

/// Replication role of a member instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceRole {
    Primary,
    Secondary,
    /// Role cannot be determined because the node is unreachable.
    Unreachable,
}

/// Live state of a member instance within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Online,
    /// Joining and catching up (clone or incremental recovery).
    Recovering,
    Offline,
    Error,
    /// Listed in metadata but absent from the live group view.
    Missing,
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Primary => write!(f, "PRIMARY"),
            InstanceRole::Secondary => write!(f, "SECONDARY"),
            InstanceRole::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Online => write!(f, "ONLINE"),
            InstanceState::Recovering => write!(f, "RECOVERING"),
            InstanceState::Offline => write!(f, "OFFLINE"),
            InstanceState::Error => write!(f, "ERROR"),
            InstanceState::Missing => write!(f, "MISSING"),
        }
    }
}

/// A member instance, owned by exactly one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Cluster-local UUID reported by the node itself.
    pub id: InstanceId,
    pub endpoint: Endpoint,
    pub role: InstanceRole,
    pub state: InstanceState,
    /// Last-known applied-transaction set (advisory; the probe is the
    /// source of truth for live comparisons).
    pub applied_set: AppliedSet,
    pub read_only: bool,
    /// Name of the recovery account provisioned when this instance was
    /// added; dropped (and channel credentials rotated) on removal.
    #[serde(default)]
    pub recovery_account: Option<String>,
}

impl Instance {
    pub fn is_online(&self) -> bool {
        self.state == InstanceState::Online
    }
}

// ── Cluster ─────────────────────────────────────────────────────────────────

/// Topology mode of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyMode {
    SinglePrimary,
    MultiPrimary,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMode::SinglePrimary => write!(f, "SINGLE_PRIMARY"),
            TopologyMode::MultiPrimary => write!(f, "MULTI_PRIMARY"),
        }
    }
}

/// Role of a cluster within its cluster set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterRole {
    PrimaryCluster,
    ReplicaCluster,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::PrimaryCluster => write!(f, "PRIMARY_CLUSTER"),
            ClusterRole::ReplicaCluster => write!(f, "REPLICA_CLUSTER"),
        }
    }
}

/// A group-replicated cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    /// Unique within a cluster set.
    pub name: String,
    pub mode: TopologyMode,
    pub members: Vec<Instance>,
    /// Membership epoch: bumped on every view change so stale views are
    /// distinguishable after reconfiguration.
    pub view_change_id: u64,
}

impl Cluster {
    pub fn new(id: ClusterId, name: impl Into<String>, mode: TopologyMode) -> Self {
        Self {
            id,
            name: name.into(),
            mode,
            members: Vec::new(),
            view_change_id: 1,
        }
    }

    /// The member currently holding the PRIMARY role, if any.
    ///
    /// In `SinglePrimary` mode there is at most one; zero only while
    /// quorum is lost or during a managed switchover window.
    pub fn primary(&self) -> Option<&Instance> {
        self.members
            .iter()
            .find(|m| m.role == InstanceRole::Primary)
    }

    pub fn member(&self, endpoint: &Endpoint) -> Option<&Instance> {
        self.members.iter().find(|m| &m.endpoint == endpoint)
    }

    pub fn member_mut(&mut self, endpoint: &Endpoint) -> Option<&mut Instance> {
        self.members.iter_mut().find(|m| &m.endpoint == endpoint)
    }

    pub fn has_member(&self, endpoint: &Endpoint) -> bool {
        self.member(endpoint).is_some()
    }

    pub fn online_members(&self) -> impl Iterator<Item = &Instance> {
        self.members.iter().filter(|m| m.is_online())
    }

    /// Remove a member by endpoint; returns the removed instance.
    pub fn remove_member(&mut self, endpoint: &Endpoint) -> Option<Instance> {
        let idx = self.members.iter().position(|m| &m.endpoint == endpoint)?;
        Some(self.members.remove(idx))
    }

    /// Check the single-primary invariant. Only meaningful when the
    /// cluster has quorum; during an outage zero primaries is legal.
    pub fn check_single_primary(&self) -> CorralResult<()> {
        if self.mode != TopologyMode::SinglePrimary {
            return Ok(());
        }
        let primaries = self
            .members
            .iter()
            .filter(|m| m.role == InstanceRole::Primary)
            .count();
        if primaries > 1 {
            return Err(CorralError::Internal(format!(
                "cluster '{}' has {} PRIMARY members in SINGLE_PRIMARY mode",
                self.name, primaries
            )));
        }
        Ok(())
    }
}

// ── Cluster Set ─────────────────────────────────────────────────────────────

/// A federation of clusters under one domain: exactly one primary cluster
/// and zero or more replica clusters.
///
/// The one-primary invariant is structural — there is no role field to
/// get out of sync; a promote swaps `primary_cluster` and the member
/// lists atomically inside a metadata commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSet {
    pub id: ClusterSetId,
    pub domain_name: String,
    pub primary_cluster: ClusterId,
    pub replica_clusters: Vec<ClusterId>,
}

impl ClusterSet {
    pub fn new(id: ClusterSetId, domain_name: impl Into<String>, primary: ClusterId) -> Self {
        Self {
            id,
            domain_name: domain_name.into(),
            primary_cluster: primary,
            replica_clusters: Vec::new(),
        }
    }

    /// Role of `cluster` within this set, if it is a member.
    pub fn role_of(&self, cluster: ClusterId) -> Option<ClusterRole> {
        if cluster == self.primary_cluster {
            Some(ClusterRole::PrimaryCluster)
        } else if self.replica_clusters.contains(&cluster) {
            Some(ClusterRole::ReplicaCluster)
        } else {
            None
        }
    }

    pub fn contains(&self, cluster: ClusterId) -> bool {
        self.role_of(cluster).is_some()
    }

    /// All member cluster ids, primary first.
    pub fn member_clusters(&self) -> impl Iterator<Item = ClusterId> + '_ {
        std::iter::once(self.primary_cluster).chain(self.replica_clusters.iter().copied())
    }

    /// Sanity-check internal consistency: the primary must not also be
    /// listed as a replica, and replica ids must be unique.
    pub fn check_invariants(&self) -> CorralResult<()> {
        if self.replica_clusters.contains(&self.primary_cluster) {
            return Err(CorralError::Internal(format!(
                "cluster set '{}': {} is both primary and replica",
                self.domain_name, self.primary_cluster
            )));
        }
        let mut seen = self.replica_clusters.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.replica_clusters.len() {
            return Err(CorralError::Internal(format!(
                "cluster set '{}': duplicate replica cluster entries",
                self.domain_name
            )));
        }
        Ok(())
    }
}

// ── Replication Channel ─────────────────────────────────────────────────────

/// An asynchronous replication channel binding a replica cluster's primary
/// instance (subscriber) to the cluster set's primary cluster's primary
/// instance (source).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationChannel {
    pub name: ChannelName,
    /// The replica cluster this channel feeds.
    pub cluster: ClusterId,
    /// Current source endpoint: the set's primary cluster's primary.
    pub source: Endpoint,
    /// Current subscriber endpoint: the replica cluster's primary.
    pub subscriber: Endpoint,
    /// Credential reference used to re-authenticate after repointing.
    /// Never a raw secret.
    pub credential: CredentialRef,
    /// Optional intentional apply delay.
    pub applier_delay_secs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(uuid: &str, host: &str, role: InstanceRole, state: InstanceState) -> Instance {
        Instance {
            id: InstanceId(uuid.into()),
            endpoint: Endpoint::new(host, 3306),
            role,
            state,
            applied_set: AppliedSet::new(),
            read_only: role != InstanceRole::Primary,
            recovery_account: None,
        }
    }

    #[test]
    fn cluster_primary_lookup() {
        let mut c = Cluster::new(ClusterId(1), "main", TopologyMode::SinglePrimary);
        c.members.push(inst("u1", "a", InstanceRole::Primary, InstanceState::Online));
        c.members.push(inst("u2", "b", InstanceRole::Secondary, InstanceState::Online));
        assert_eq!(c.primary().unwrap().endpoint.host, "a");
        assert!(c.check_single_primary().is_ok());
    }

    #[test]
    fn double_primary_violates_invariant() {
        let mut c = Cluster::new(ClusterId(1), "main", TopologyMode::SinglePrimary);
        c.members.push(inst("u1", "a", InstanceRole::Primary, InstanceState::Online));
        c.members.push(inst("u2", "b", InstanceRole::Primary, InstanceState::Online));
        assert!(c.check_single_primary().is_err());
    }

    #[test]
    fn zero_primaries_is_legal_during_outage() {
        let mut c = Cluster::new(ClusterId(1), "main", TopologyMode::SinglePrimary);
        c.members.push(inst("u1", "a", InstanceRole::Secondary, InstanceState::Offline));
        assert!(c.check_single_primary().is_ok());
    }

    #[test]
    fn cluster_set_roles_are_structural() {
        let mut set = ClusterSet::new(ClusterSetId(1), "example.com", ClusterId(1));
        set.replica_clusters.push(ClusterId(2));
        assert_eq!(set.role_of(ClusterId(1)), Some(ClusterRole::PrimaryCluster));
        assert_eq!(set.role_of(ClusterId(2)), Some(ClusterRole::ReplicaCluster));
        assert_eq!(set.role_of(ClusterId(3)), None);
        assert!(set.check_invariants().is_ok());
    }

    #[test]
    fn primary_listed_as_replica_is_rejected() {
        let mut set = ClusterSet::new(ClusterSetId(1), "example.com", ClusterId(1));
        set.replica_clusters.push(ClusterId(1));
        assert!(set.check_invariants().is_err());
    }
}
