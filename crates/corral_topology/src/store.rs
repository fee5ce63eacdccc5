//! Versioned metadata store with optimistic concurrency.
//!
//! Orchestrator operations run for minutes (bounded by recovery and
//! catch-up time), so the store never holds a lock across an operation.
//! Instead every mutation is a read-validate-write cycle:
//!
//! 1. `read()` returns a [`TopologySnapshot`] plus its [`MetadataVersion`]
//! 2. the operation stages [`TopologyDelta`]s in a [`MetadataTxn`]
//! 3. `commit()` applies them only if the version is unchanged, otherwise
//!    it fails with `VersionConflict` and the caller reloads and retries
//!
//! Commits are all-or-nothing: a delta that fails to apply leaves the
//! stored snapshot untouched.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use corral_common::types::{ClusterId, ClusterSetId, Endpoint};
use corral_common::{CorralError, CorralResult};

use crate::model::{Cluster, ClusterSet, ReplicationChannel};

/// Monotonic version stamp of the metadata record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MetadataVersion(pub u64);

/// The durable projection of the topology: clusters, cluster sets and
/// replication channels. Channels are keyed by the replica cluster they
/// feed (one channel per replica cluster).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub clusters: BTreeMap<ClusterId, Cluster>,
    pub cluster_sets: BTreeMap<ClusterSetId, ClusterSet>,
    pub channels: BTreeMap<ClusterId, ReplicationChannel>,
}

impl TopologySnapshot {
    pub fn cluster(&self, id: ClusterId) -> CorralResult<&Cluster> {
        self.clusters
            .get(&id)
            .ok_or_else(|| CorralError::PreconditionFailed(format!("unknown cluster {id}")))
    }

    pub fn cluster_set(&self, id: ClusterSetId) -> CorralResult<&ClusterSet> {
        self.cluster_sets
            .get(&id)
            .ok_or_else(|| CorralError::PreconditionFailed(format!("unknown cluster set {id}")))
    }

    /// The cluster set a cluster belongs to, if any. A cluster belongs to
    /// at most one set.
    pub fn set_of_cluster(&self, cluster: ClusterId) -> Option<&ClusterSet> {
        self.cluster_sets.values().find(|s| s.contains(cluster))
    }

    /// Find the cluster owning the member at `endpoint`.
    pub fn cluster_of_endpoint(&self, endpoint: &Endpoint) -> Option<&Cluster> {
        self.clusters.values().find(|c| c.has_member(endpoint))
    }

    pub fn next_cluster_id(&self) -> ClusterId {
        ClusterId(self.clusters.keys().map(|c| c.0).max().unwrap_or(0) + 1)
    }

    pub fn next_cluster_set_id(&self) -> ClusterSetId {
        ClusterSetId(self.cluster_sets.keys().map(|c| c.0).max().unwrap_or(0) + 1)
    }

    /// Check cross-entity invariants: at most one primary per
    /// single-primary cluster, every set member exists, set internal
    /// consistency holds, every channel's cluster is a replica member of
    /// some set.
    pub fn check_invariants(&self) -> CorralResult<()> {
        for cluster in self.clusters.values() {
            cluster.check_single_primary()?;
        }
        for set in self.cluster_sets.values() {
            set.check_invariants()?;
            for cid in set.member_clusters() {
                if !self.clusters.contains_key(&cid) {
                    return Err(CorralError::Internal(format!(
                        "cluster set '{}' references missing cluster {cid}",
                        set.domain_name
                    )));
                }
            }
        }
        for (cid, channel) in &self.channels {
            if channel.cluster != *cid {
                return Err(CorralError::Internal(format!(
                    "channel map key {cid} does not match channel cluster {}",
                    channel.cluster
                )));
            }
            match self.set_of_cluster(*cid) {
                Some(set) if set.primary_cluster != *cid => {}
                _ => {
                    return Err(CorralError::Internal(format!(
                        "channel exists for {cid} which is not a replica cluster of any set"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A single mutation of the topology record. Deltas are coarse-grained on
/// purpose: an operation computes the desired entity value and stages a
/// put, so replaying a delta list is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopologyDelta {
    PutCluster(Cluster),
    DropCluster(ClusterId),
    PutClusterSet(ClusterSet),
    DropClusterSet(ClusterSetId),
    PutChannel(ReplicationChannel),
    DropChannel(ClusterId),
}

impl TopologyDelta {
    /// Apply this delta to a snapshot. Drops of absent entities are
    /// idempotent no-ops; puts always overwrite.
    pub fn apply(&self, snapshot: &mut TopologySnapshot) {
        match self {
            TopologyDelta::PutCluster(c) => {
                snapshot.clusters.insert(c.id, c.clone());
            }
            TopologyDelta::DropCluster(id) => {
                snapshot.clusters.remove(id);
            }
            TopologyDelta::PutClusterSet(s) => {
                snapshot.cluster_sets.insert(s.id, s.clone());
            }
            TopologyDelta::DropClusterSet(id) => {
                snapshot.cluster_sets.remove(id);
            }
            TopologyDelta::PutChannel(ch) => {
                snapshot.channels.insert(ch.cluster, ch.clone());
            }
            TopologyDelta::DropChannel(id) => {
                snapshot.channels.remove(id);
            }
        }
    }

    /// Short name for event logs and partial-failure reports.
    pub fn describe(&self) -> String {
        match self {
            TopologyDelta::PutCluster(c) => format!("put_cluster({})", c.id),
            TopologyDelta::DropCluster(id) => format!("drop_cluster({id})"),
            TopologyDelta::PutClusterSet(s) => format!("put_cluster_set({})", s.id),
            TopologyDelta::DropClusterSet(id) => format!("drop_cluster_set({id})"),
            TopologyDelta::PutChannel(ch) => format!("put_channel({})", ch.cluster),
            TopologyDelta::DropChannel(id) => format!("drop_channel({id})"),
        }
    }
}

/// Transactional access to the metadata record.
pub trait MetadataStore: Send + Sync {
    /// Read the current snapshot and its version.
    fn read(&self) -> (TopologySnapshot, MetadataVersion);

    /// Apply `deltas` atomically iff the store is still at `expected`.
    /// Returns the new version, or `VersionConflict`.
    fn commit(
        &self,
        expected: MetadataVersion,
        deltas: &[TopologyDelta],
    ) -> CorralResult<MetadataVersion>;
}

/// In-memory metadata store. The production deployment persists the
/// record inside the managed cluster itself; this implementation backs
/// tests and embedded use, and is the reference for the versioning
/// semantics any backend must honor.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    inner: Mutex<(TopologySnapshot, MetadataVersion)>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: TopologySnapshot) -> Self {
        Self {
            inner: Mutex::new((snapshot, MetadataVersion(0))),
        }
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn read(&self) -> (TopologySnapshot, MetadataVersion) {
        let guard = self.inner.lock();
        (guard.0.clone(), guard.1)
    }

    fn commit(
        &self,
        expected: MetadataVersion,
        deltas: &[TopologyDelta],
    ) -> CorralResult<MetadataVersion> {
        let mut guard = self.inner.lock();
        if guard.1 != expected {
            return Err(CorralError::VersionConflict {
                expected: expected.0,
                actual: guard.1 .0,
            });
        }
        // Apply to a scratch copy first so a failed invariant check
        // leaves the stored snapshot untouched.
        let mut next = guard.0.clone();
        for delta in deltas {
            delta.apply(&mut next);
        }
        next.check_invariants()?;
        let version = MetadataVersion(guard.1 .0 + 1);
        *guard = (next, version);
        tracing::debug!(version = version.0, deltas = deltas.len(), "metadata committed");
        Ok(version)
    }
}

/// An optimistic metadata transaction: a working snapshot plus the staged
/// delta list that produced it. Staged deltas are applied to the working
/// copy immediately so later validation within the same operation reads
/// its own writes.
pub struct MetadataTxn {
    base_version: MetadataVersion,
    working: TopologySnapshot,
    staged: Vec<TopologyDelta>,
}

impl MetadataTxn {
    /// Begin a transaction from the store's current state.
    pub fn begin(store: &dyn MetadataStore) -> Self {
        let (snapshot, version) = store.read();
        Self {
            base_version: version,
            working: snapshot,
            staged: Vec::new(),
        }
    }

    /// The working snapshot, including all staged deltas.
    pub fn snapshot(&self) -> &TopologySnapshot {
        &self.working
    }

    pub fn base_version(&self) -> MetadataVersion {
        self.base_version
    }

    /// Stage a delta and apply it to the working copy.
    pub fn stage(&mut self, delta: TopologyDelta) {
        delta.apply(&mut self.working);
        self.staged.push(delta);
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Commit all staged deltas. Fails with `VersionConflict` if another
    /// writer advanced the store since `begin`.
    pub fn commit(self, store: &dyn MetadataStore) -> CorralResult<MetadataVersion> {
        store.commit(self.base_version, &self.staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TopologyMode;

    fn cluster(id: u64, name: &str) -> Cluster {
        Cluster::new(ClusterId(id), name, TopologyMode::SinglePrimary)
    }

    #[test]
    fn commit_bumps_version_and_applies() {
        let store = InMemoryMetadataStore::new();
        let (_, v0) = store.read();

        let v1 = store
            .commit(v0, &[TopologyDelta::PutCluster(cluster(1, "main"))])
            .unwrap();
        assert_eq!(v1, MetadataVersion(1));

        let (snap, v) = store.read();
        assert_eq!(v, v1);
        assert_eq!(snap.clusters.len(), 1);
        assert_eq!(snap.cluster(ClusterId(1)).unwrap().name, "main");
    }

    #[test]
    fn stale_version_is_rejected() {
        let store = InMemoryMetadataStore::new();
        let (_, v0) = store.read();
        store
            .commit(v0, &[TopologyDelta::PutCluster(cluster(1, "a"))])
            .unwrap();

        // Second writer still holding v0.
        let err = store
            .commit(v0, &[TopologyDelta::PutCluster(cluster(2, "b"))])
            .unwrap_err();
        assert!(matches!(err, CorralError::VersionConflict { expected: 0, actual: 1 }));

        // The losing write must not have applied.
        let (snap, _) = store.read();
        assert!(!snap.clusters.contains_key(&ClusterId(2)));
    }

    #[test]
    fn failed_invariant_check_rolls_back_whole_commit() {
        let store = InMemoryMetadataStore::new();
        let (_, v0) = store.read();

        // Cluster set referencing a cluster that is never put.
        let set = ClusterSet::new(ClusterSetId(1), "dom", ClusterId(99));
        let err = store
            .commit(
                v0,
                &[
                    TopologyDelta::PutCluster(cluster(1, "a")),
                    TopologyDelta::PutClusterSet(set),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, CorralError::Internal(_)));

        // Nothing applied, version unchanged.
        let (snap, v) = store.read();
        assert_eq!(v, v0);
        assert!(snap.clusters.is_empty());
    }

    #[test]
    fn txn_reads_its_own_writes_and_commits() {
        let store = InMemoryMetadataStore::new();
        let mut txn = MetadataTxn::begin(&store);
        txn.stage(TopologyDelta::PutCluster(cluster(1, "main")));
        assert!(txn.snapshot().clusters.contains_key(&ClusterId(1)));

        let v = txn.commit(&store).unwrap();
        assert_eq!(v, MetadataVersion(1));
    }

    #[test]
    fn concurrent_txns_second_fails() {
        let store = InMemoryMetadataStore::new();
        let mut t1 = MetadataTxn::begin(&store);
        let mut t2 = MetadataTxn::begin(&store);
        t1.stage(TopologyDelta::PutCluster(cluster(1, "a")));
        t2.stage(TopologyDelta::PutCluster(cluster(2, "b")));

        t1.commit(&store).unwrap();
        let err = t2.commit(&store).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn drop_of_absent_entity_is_noop() {
        let store = InMemoryMetadataStore::new();
        let (_, v0) = store.read();
        let v1 = store
            .commit(v0, &[TopologyDelta::DropCluster(ClusterId(42))])
            .unwrap();
        assert_eq!(v1, MetadataVersion(1));
    }

    #[test]
    fn double_primary_cluster_is_rejected_at_commit() {
        use crate::gtid::AppliedSet;
        use crate::model::{Instance, InstanceRole, InstanceState};
        use corral_common::types::InstanceId;

        let mut c = cluster(1, "main");
        for (uuid, host) in [("u1", "a"), ("u2", "b")] {
            c.members.push(Instance {
                id: InstanceId(uuid.into()),
                endpoint: Endpoint::new(host, 3306),
                role: InstanceRole::Primary,
                state: InstanceState::Online,
                applied_set: AppliedSet::new(),
                read_only: false,
                recovery_account: None,
            });
        }

        let store = InMemoryMetadataStore::new();
        let (_, v0) = store.read();
        let err = store
            .commit(v0, &[TopologyDelta::PutCluster(c)])
            .unwrap_err();
        assert!(matches!(err, CorralError::Internal(_)));
        let (snap, v) = store.read();
        assert_eq!(v, v0);
        assert!(snap.clusters.is_empty());
    }

    #[test]
    fn channel_for_non_replica_cluster_is_rejected() {
        use corral_common::types::{ChannelName, CredentialRef};
        let store = InMemoryMetadataStore::new();
        let (_, v0) = store.read();
        let ch = ReplicationChannel {
            name: ChannelName("clusterset_replication".into()),
            cluster: ClusterId(1),
            source: Endpoint::new("p", 3306),
            subscriber: Endpoint::new("r", 3306),
            credential: CredentialRef("cred-1".into()),
            applier_delay_secs: 0,
        };
        let err = store
            .commit(
                v0,
                &[
                    TopologyDelta::PutCluster(cluster(1, "standalone")),
                    TopologyDelta::PutChannel(ch),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, CorralError::Internal(_)));
    }
}
