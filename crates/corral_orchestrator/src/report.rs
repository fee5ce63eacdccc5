//! Read-only topology reports: live status, metadata description, and
//! drift detection.
//!
//! `status` merges the metadata record with live probe readings — the
//! metadata says who *should* be in the topology, the probes say who is.
//! `describe` is the metadata-only view. `rescan` diffs the two and can
//! optionally fold the live truth back into metadata.

use serde::Serialize;

use corral_common::types::{ClusterId, ClusterSetId, Endpoint};
use corral_common::{CorralResult, OpPhase};
use corral_topology::model::{ClusterRole, InstanceRole, InstanceState, TopologyMode};
use corral_topology::store::{MetadataTxn, TopologySnapshot, TopologyDelta};

use crate::orchestrator::Orchestrator;
use crate::outcome::{OpResult, Outcome, PhaseExt};

/// Live view of one member instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub endpoint: Endpoint,
    pub role: InstanceRole,
    pub state: InstanceState,
    pub read_only: bool,
    pub reachable: bool,
}

/// Merged metadata + live view of one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub id: ClusterId,
    pub name: String,
    pub mode: TopologyMode,
    /// Role within a cluster set, if the cluster belongs to one.
    pub set_role: Option<ClusterRole>,
    pub has_quorum: bool,
    pub primary: Option<Endpoint>,
    pub instances: Vec<InstanceStatus>,
    /// Replica cluster channel source, when one is configured.
    pub channel_source: Option<Endpoint>,
    /// Whether the channel currently reports applying with no error.
    pub channel_applying: bool,
}

/// Merged view of a whole cluster set.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSetStatus {
    pub id: ClusterSetId,
    pub domain_name: String,
    pub primary_cluster: ClusterId,
    pub clusters: Vec<ClusterStatus>,
}

/// Differences between the metadata record and the live topology.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    pub cluster: ClusterId,
    /// Live group members the metadata does not list.
    pub unregistered_members: Vec<Endpoint>,
    /// Metadata members absent from every live group view.
    pub absent_members: Vec<Endpoint>,
    /// Metadata members whose recorded role or state disagrees with the
    /// live reading.
    pub stale_members: Vec<Endpoint>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.unregistered_members.is_empty()
            && self.absent_members.is_empty()
            && self.stale_members.is_empty()
    }
}

impl Orchestrator {
    /// Live status of one cluster: metadata membership annotated with
    /// probe readings. Never mutates.
    pub fn cluster_status(&self, cluster_id: ClusterId) -> CorralResult<ClusterStatus> {
        let (snapshot, _) = self.store.read();
        let cluster = snapshot.cluster(cluster_id)?;

        let mut instances = Vec::with_capacity(cluster.members.len());
        let mut primary = None;
        for member in &cluster.members {
            match self.probe.read_state(&member.endpoint) {
                Ok(reading) => {
                    if reading.role == InstanceRole::Primary && reading.is_online() {
                        primary = Some(member.endpoint.clone());
                    }
                    instances.push(InstanceStatus {
                        endpoint: member.endpoint.clone(),
                        role: reading.role,
                        state: reading.state,
                        read_only: reading.read_only,
                        reachable: true,
                    });
                }
                Err(_) => instances.push(InstanceStatus {
                    endpoint: member.endpoint.clone(),
                    role: InstanceRole::Unreachable,
                    state: InstanceState::Missing,
                    read_only: true,
                    reachable: false,
                }),
            }
        }

        let set_role = snapshot
            .set_of_cluster(cluster_id)
            .and_then(|s| s.role_of(cluster_id));

        let (channel_source, channel_applying) = match snapshot.channels.get(&cluster_id) {
            Some(ch) => {
                let applying = self
                    .probe
                    .read_state(&ch.subscriber)
                    .ok()
                    .and_then(|r| r.channels.get(&ch.name.0).cloned())
                    .is_some_and(|h| h.applying && h.last_error.is_none());
                (Some(ch.source.clone()), applying)
            }
            None => (None, false),
        };

        Ok(ClusterStatus {
            id: cluster.id,
            name: cluster.name.clone(),
            mode: cluster.mode,
            set_role,
            has_quorum: self.evaluator().has_quorum(cluster),
            primary,
            instances,
            channel_source,
            channel_applying,
        })
    }

    /// Live status of a whole cluster set, primary cluster first.
    pub fn cluster_set_status(&self, set_id: ClusterSetId) -> CorralResult<ClusterSetStatus> {
        let (snapshot, _) = self.store.read();
        let set = snapshot.cluster_set(set_id)?;

        let mut clusters = Vec::new();
        for cid in set.member_clusters() {
            clusters.push(self.cluster_status(cid)?);
        }
        Ok(ClusterSetStatus {
            id: set.id,
            domain_name: set.domain_name.clone(),
            primary_cluster: set.primary_cluster,
            clusters,
        })
    }

    /// The metadata record as-is, without touching any instance.
    pub fn describe(&self) -> TopologySnapshot {
        self.store.read().0
    }

    /// Diff metadata against the live topology. With `repair`, fold live
    /// roles/states back into metadata and register live group members
    /// the record is missing; absent members are reported, never removed
    /// automatically.
    pub fn rescan(&self, cluster_id: ClusterId, repair: bool) -> OpResult<DriftReport> {
        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let mut cluster = txn
            .snapshot()
            .cluster(cluster_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        let mut report = DriftReport {
            cluster: cluster_id,
            ..DriftReport::default()
        };

        // Collect the live group view from any reachable ONLINE member.
        let mut live_view: Vec<Endpoint> = Vec::new();
        for member in &cluster.members {
            if let Ok(reading) = self.probe.read_state(&member.endpoint) {
                if reading.is_online() && !reading.peers_online.is_empty() {
                    live_view = reading.peers_online.clone();
                    break;
                }
            }
        }

        for endpoint in &live_view {
            if !cluster.has_member(endpoint) {
                report.unregistered_members.push(endpoint.clone());
            }
        }
        for member in &cluster.members {
            if !live_view.is_empty() && !live_view.contains(&member.endpoint) {
                report.absent_members.push(member.endpoint.clone());
                continue;
            }
            if let Ok(reading) = self.probe.read_state(&member.endpoint) {
                if reading.role != member.role || reading.state != member.state {
                    report.stale_members.push(member.endpoint.clone());
                }
            }
        }

        if !repair {
            return Ok(Outcome::new(report));
        }

        // repair: refresh recorded roles/states and adopt unregistered
        // live members.
        self.refresh_members(&mut cluster);
        for endpoint in &report.unregistered_members {
            if let Ok(reading) = self.probe.read_state(endpoint) {
                cluster.members.push(corral_topology::model::Instance {
                    id: reading.instance_id.clone(),
                    endpoint: endpoint.clone(),
                    role: reading.role,
                    state: reading.state,
                    applied_set: reading.applied_set.clone(),
                    read_only: reading.read_only,
                    recovery_account: None,
                });
            }
        }
        let mut out = Outcome::new(report);
        if !out.value.absent_members.is_empty() {
            out.push_warning(format!(
                "{} metadata member(s) are absent from the live group; remove or \
                 rejoin them explicitly",
                out.value.absent_members.len()
            ));
        }
        txn.stage(TopologyDelta::PutCluster(cluster));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use corral_common::{CancelToken, OrchestratorConfig};
    use corral_topology::store::InMemoryMetadataStore;

    use super::*;
    use crate::outcome::OpOptions;
    use crate::sim::SimFleet;

    fn orchestrator(fleet: &SimFleet) -> Orchestrator {
        let mut config = OrchestratorConfig::default();
        config.convergence.poll_interval_ms = 1;
        config.convergence.timeout_ms = 500;
        config.convergence.sync_timeout_ms = 500;
        config.recovery.recovery_timeout_ms = 500;
        Orchestrator::new(
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(fleet.clone()),
            Arc::new(fleet.clone()),
            config,
            fleet.admin_credential(),
        )
    }

    #[test]
    fn status_merges_metadata_and_live_state() {
        let fleet = SimFleet::new();
        let orch = orchestrator(&fleet);
        let cancel = CancelToken::new();
        let opts = OpOptions::default();

        let a = fleet.add_node("a", 3306);
        let b = fleet.add_node("b", 3306);
        let cid = orch
            .create_cluster("main", &a, TopologyMode::SinglePrimary, &opts, &cancel)
            .unwrap()
            .value;
        orch.add_instance(cid, &b, &opts, &cancel).unwrap();

        let status = orch.cluster_status(cid).unwrap();
        assert_eq!(status.name, "main");
        assert!(status.has_quorum);
        assert_eq!(status.primary.as_ref(), Some(&a));
        assert_eq!(status.instances.len(), 2);
        assert!(status.instances.iter().all(|i| i.reachable));
        assert!(status.channel_source.is_none());
    }

    #[test]
    fn status_marks_unreachable_members() {
        let fleet = SimFleet::new();
        let orch = orchestrator(&fleet);
        let cancel = CancelToken::new();
        let opts = OpOptions::default();

        let a = fleet.add_node("a", 3306);
        let b = fleet.add_node("b", 3306);
        let cid = orch
            .create_cluster("main", &a, TopologyMode::SinglePrimary, &opts, &cancel)
            .unwrap()
            .value;
        orch.add_instance(cid, &b, &opts, &cancel).unwrap();
        fleet.set_reachable(&b, false);

        let status = orch.cluster_status(cid).unwrap();
        let down = status
            .instances
            .iter()
            .find(|i| i.endpoint == b)
            .unwrap();
        assert!(!down.reachable);
        assert_eq!(down.state, InstanceState::Missing);
    }

    #[test]
    fn rescan_detects_and_repairs_stale_roles() {
        let fleet = SimFleet::new();
        let orch = orchestrator(&fleet);
        let cancel = CancelToken::new();
        let opts = OpOptions::default();

        let a = fleet.add_node("a", 3306);
        let b = fleet.add_node("b", 3306);
        let c = fleet.add_node("c", 3306);
        let cid = orch
            .create_cluster("main", &a, TopologyMode::SinglePrimary, &opts, &cancel)
            .unwrap()
            .value;
        orch.add_instance(cid, &b, &opts, &cancel).unwrap();
        orch.add_instance(cid, &c, &opts, &cancel).unwrap();

        // The primary dies behind the orchestrator's back; the surviving
        // majority elects b.
        fleet.set_reachable(&a, false);
        fleet.settle();

        let report = orch.rescan(cid, false).unwrap().value;
        assert!(!report.is_clean());

        let repaired = orch.rescan(cid, true).unwrap().value;
        assert!(repaired.stale_members.contains(&b) || repaired.absent_members.contains(&a));
        let snap = orch.describe();
        let stored = snap.cluster(cid).unwrap();
        assert_eq!(
            stored.member(&b).unwrap().role,
            InstanceRole::Primary
        );
    }

    #[test]
    fn rescan_on_clean_cluster_is_clean() {
        let fleet = SimFleet::new();
        let orch = orchestrator(&fleet);
        let cancel = CancelToken::new();
        let opts = OpOptions::default();

        let a = fleet.add_node("a", 3306);
        let cid = orch
            .create_cluster("main", &a, TopologyMode::SinglePrimary, &opts, &cancel)
            .unwrap()
            .value;
        let report = orch.rescan(cid, false).unwrap().value;
        assert!(report.is_clean(), "unexpected drift: {report:?}");
    }
}
