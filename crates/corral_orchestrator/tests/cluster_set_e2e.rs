//! Cluster set end-to-end scenarios: federation build-up, channel
//! repointing across primary changes, and replica cluster detachment.

use std::sync::Arc;

use corral_common::types::{ClusterId, ClusterSetId, Endpoint};
use corral_common::{CancelToken, CorralError, OpPhase, OrchestratorConfig};
use corral_orchestrator::{OpOptions, Orchestrator, SimFleet};
use corral_topology::model::{ClusterRole, InstanceRole, TopologyMode};
use corral_topology::store::InMemoryMetadataStore;

fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.convergence.poll_interval_ms = 1;
    config.convergence.timeout_ms = 1_000;
    config.convergence.sync_timeout_ms = 1_000;
    config.recovery.recovery_timeout_ms = 1_000;
    config
}

struct Harness {
    fleet: SimFleet,
    orch: Orchestrator,
    cancel: CancelToken,
    opts: OpOptions,
}

fn harness() -> Harness {
    let fleet = SimFleet::new();
    let orch = Orchestrator::new(
        Arc::new(InMemoryMetadataStore::new()),
        Arc::new(fleet.clone()),
        Arc::new(fleet.clone()),
        fast_config(),
        fleet.admin_credential(),
    );
    Harness {
        fleet,
        orch,
        cancel: CancelToken::new(),
        opts: OpOptions::default(),
    }
}

struct Federation {
    set_id: ClusterSetId,
    primary_cid: ClusterId,
    replica_cid: ClusterId,
    a1: Endpoint,
    a2: Endpoint,
    c1: Endpoint,
    c2: Endpoint,
}

/// Primary cluster {a1 (primary), a2} federated with replica cluster
/// {c1 (primary), c2}.
fn federation(h: &Harness) -> Federation {
    let a1 = h.fleet.add_node("a1", 3306);
    let a2 = h.fleet.add_node("a2", 3306);
    let c1 = h.fleet.add_node("c1", 3306);
    let c2 = h.fleet.add_node("c2", 3306);

    let primary_cid = h
        .orch
        .create_cluster("alpha", &a1, TopologyMode::SinglePrimary, &h.opts, &h.cancel)
        .unwrap()
        .value;
    h.orch.add_instance(primary_cid, &a2, &h.opts, &h.cancel).unwrap();
    h.fleet.write(&a1, 3);

    let set_id = h
        .orch
        .create_cluster_set(primary_cid, "corral.example", &h.opts, &h.cancel)
        .unwrap()
        .value;
    let replica_cid = h
        .orch
        .create_replica_cluster(set_id, "gamma", &c1, &h.opts, &h.cancel)
        .unwrap()
        .value;
    h.orch.add_instance(replica_cid, &c2, &h.opts, &h.cancel).unwrap();

    Federation {
        set_id,
        primary_cid,
        replica_cid,
        a1,
        a2,
        c1,
        c2,
    }
}

#[test]
fn replica_cluster_follows_the_set_primary() {
    let h = harness();
    let f = federation(&h);

    // The channel rides on c1 and points at a1.
    assert_eq!(h.fleet.channel_source(&f.c1).as_ref(), Some(&f.a1));
    assert!(h.fleet.channel_running(&f.c1));

    // Writes on the set primary flow through the channel.
    h.fleet.write(&f.a1, 5);
    h.fleet.settle();
    assert!(h.fleet.applied_of(&f.a1).is_subset_of(&h.fleet.applied_of(&f.c1)));

    let status = h.orch.cluster_set_status(f.set_id).unwrap();
    assert_eq!(status.primary_cluster, f.primary_cid);
    assert_eq!(status.clusters.len(), 2);
    assert_eq!(status.clusters[0].set_role, Some(ClusterRole::PrimaryCluster));
    assert_eq!(status.clusters[1].set_role, Some(ClusterRole::ReplicaCluster));
    assert!(status.clusters[1].channel_applying);
}

#[test]
fn exactly_one_primary_cluster_after_every_operation() {
    let h = harness();
    let f = federation(&h);

    let check = |h: &Harness| {
        let snap = h.orch.describe();
        for set in snap.cluster_sets.values() {
            set.check_invariants().unwrap();
            assert!(snap.clusters.contains_key(&set.primary_cluster));
        }
    };
    check(&h);

    h.orch
        .set_primary_instance(f.primary_cid, &f.a2, &h.opts, &h.cancel)
        .unwrap();
    check(&h);

    h.orch
        .remove_cluster(f.set_id, f.replica_cid, &h.opts, &h.cancel)
        .unwrap();
    check(&h);
}

#[test]
fn switchover_on_primary_cluster_repoints_replica_channels() {
    let h = harness();
    let f = federation(&h);

    h.orch
        .set_primary_instance(f.primary_cid, &f.a2, &h.opts, &h.cancel)
        .unwrap();

    assert_eq!(h.fleet.node_role(&f.a2), Some(InstanceRole::Primary));
    // Repointing happens inside the operation, so the channel already
    // names the new source when the call returns.
    assert_eq!(h.fleet.channel_source(&f.c1).as_ref(), Some(&f.a2));
    assert!(h.fleet.channel_running(&f.c1));

    let snap = h.orch.describe();
    assert_eq!(snap.channels[&f.replica_cid].source, f.a2);
}

#[test]
fn switchover_on_replica_cluster_moves_the_subscriber() {
    let h = harness();
    let f = federation(&h);

    h.orch
        .set_primary_instance(f.replica_cid, &f.c2, &h.opts, &h.cancel)
        .unwrap();

    // The new replica primary carries the channel; the demoted one does
    // not, and the source is unchanged.
    assert_eq!(h.fleet.channel_source(&f.c2).as_ref(), Some(&f.a1));
    assert!(h.fleet.channel_running(&f.c2));
    assert_eq!(h.fleet.channel_source(&f.c1), None);

    let snap = h.orch.describe();
    assert_eq!(snap.channels[&f.replica_cid].subscriber, f.c2);
}

#[test]
fn removing_primaries_cascades_channel_repointing() {
    let h = harness();
    let f = federation(&h);

    // Remove a1: a2 takes over the primary cluster and every replica
    // channel must follow it.
    h.orch
        .remove_instance(f.primary_cid, &f.a1, &h.opts, &h.cancel)
        .unwrap();
    assert_eq!(h.fleet.node_role(&f.a2), Some(InstanceRole::Primary));
    assert_eq!(h.fleet.channel_source(&f.c1).as_ref(), Some(&f.a2));

    // Remove c1: c2 takes over the replica cluster and its channel keeps
    // pointing at a2 unchanged.
    h.orch
        .remove_instance(f.replica_cid, &f.c1, &h.opts, &h.cancel)
        .unwrap();
    assert_eq!(h.fleet.node_role(&f.c2), Some(InstanceRole::Primary));
    assert_eq!(h.fleet.channel_source(&f.c2).as_ref(), Some(&f.a2));
    assert!(h.fleet.channel_running(&f.c2));

    let snap = h.orch.describe();
    let ch = &snap.channels[&f.replica_cid];
    assert_eq!(ch.source, f.a2);
    assert_eq!(ch.subscriber, f.c2);
}

#[test]
fn removing_the_set_primary_source_rotates_channel_credentials() {
    let h = harness();
    let f = federation(&h);

    let before = h.orch.describe().channels[&f.replica_cid].credential.clone();

    // a1 is the channel source and holds its credential; removing it must
    // leave the stored credential useless to it.
    h.orch
        .remove_instance(f.primary_cid, &f.a1, &h.opts, &h.cancel)
        .unwrap();

    let snap = h.orch.describe();
    let ch = &snap.channels[&f.replica_cid];
    assert_eq!(ch.source, f.a2);
    assert_ne!(ch.credential, before);
    assert!(h.fleet.channel_running(&f.c1));
}

#[test]
fn removing_a_diverged_subscriber_is_blocked() {
    let h = harness();
    let f = federation(&h);

    // Sever the channel, then give the subscriber a local history the set
    // primary has never seen while the set primary moves ahead of it.
    {
        use corral_common::types::ChannelName;
        use corral_orchestrator::{AdminCommand, ConnectionProvider};
        let mut session = h.fleet.open(&f.c1, &h.fleet.admin_credential()).unwrap();
        session
            .execute(AdminCommand::StopChannel {
                name: ChannelName("clusterset_replication".into()),
            })
            .unwrap();
    }
    h.fleet.inject_local_transactions(&f.c1, 2);
    h.fleet.write(&f.a1, 1);

    let err = h
        .orch
        .remove_instance(f.replica_cid, &f.c1, &h.opts, &h.cancel)
        .unwrap_err();
    assert_eq!(err.phase, OpPhase::Execute);
    assert!(matches!(err.source, CorralError::Diverged { .. }));

    // The sync gate fired before any mutation: membership is intact.
    let snap = h.orch.describe();
    assert!(snap.cluster(f.replica_cid).unwrap().has_member(&f.c1));
}

#[test]
fn removing_replica_subscriber_waits_for_sync() {
    let h = harness();
    let f = federation(&h);

    // Pending writes on the set primary must reach the subscriber before
    // its channel is severed.
    h.fleet.write(&f.a1, 7);
    h.orch
        .remove_instance(f.replica_cid, &f.c1, &h.opts, &h.cancel)
        .unwrap();
    assert!(h.fleet.applied_of(&f.a1).is_subset_of(&h.fleet.applied_of(&f.c2)));
}

#[test]
fn create_replica_cluster_rolls_back_on_seed_failure() {
    let h = harness();
    let f = federation(&h);

    let d1 = h.fleet.add_node("d1", 3306);
    h.fleet.fail_next_seed();
    let err = h
        .orch
        .create_replica_cluster(f.set_id, "delta", &d1, &h.opts, &h.cancel)
        .unwrap_err();
    assert_eq!(err.phase, OpPhase::Execute);

    // Nothing registered: no cluster, no channel, set unchanged.
    let snap = h.orch.describe();
    assert!(snap.clusters.values().all(|c| c.name != "delta"));
    assert_eq!(snap.cluster_set(f.set_id).unwrap().replica_clusters.len(), 1);
}

#[test]
fn create_replica_cluster_rejects_busy_target() {
    let h = harness();
    let f = federation(&h);

    // a2 is already a member of the primary cluster.
    let err = h
        .orch
        .create_replica_cluster(f.set_id, "delta", &f.a2, &h.opts, &h.cancel)
        .unwrap_err();
    assert_eq!(err.phase, OpPhase::Validate);
    assert!(matches!(err.source, CorralError::PreconditionFailed(_)));
}

#[test]
fn create_cluster_set_requires_standalone_cluster() {
    let h = harness();
    let f = federation(&h);

    let err = h
        .orch
        .create_cluster_set(f.primary_cid, "other.example", &h.opts, &h.cancel)
        .unwrap_err();
    assert_eq!(err.phase, OpPhase::Validate);
    assert!(matches!(err.source, CorralError::PreconditionFailed(_)));
}

#[test]
fn remove_cluster_detaches_and_is_idempotent() {
    let h = harness();
    let f = federation(&h);

    h.orch
        .remove_cluster(f.set_id, f.replica_cid, &h.opts, &h.cancel)
        .unwrap();

    // Channel gone on the subscriber, metadata standalone.
    assert_eq!(h.fleet.channel_source(&f.c1), None);
    let snap = h.orch.describe();
    assert!(snap.channels.is_empty());
    assert!(snap.cluster_set(f.set_id).unwrap().replica_clusters.is_empty());
    // The detached cluster keeps running on its own.
    assert_eq!(h.fleet.node_role(&f.c1), Some(InstanceRole::Primary));

    let out = h
        .orch
        .remove_cluster(f.set_id, f.replica_cid, &h.opts, &h.cancel)
        .unwrap();
    assert_eq!(out.warnings.len(), 1);
}

#[test]
fn primary_cluster_cannot_be_detached() {
    let h = harness();
    let f = federation(&h);

    let err = h
        .orch
        .remove_cluster(f.set_id, f.primary_cid, &h.opts, &h.cancel)
        .unwrap_err();
    assert_eq!(err.phase, OpPhase::Validate);
    assert!(matches!(err.source, CorralError::PreconditionFailed(_)));
}

#[test]
fn rejoined_replica_primary_gets_its_channel_reconciled() {
    let h = harness();
    let f = federation(&h);

    // The replica cluster's subscriber crashes; c2 takes over the group
    // and, on rejoin, c1 must come back as a plain secondary while the
    // channel stays on the current replica primary.
    h.orch
        .set_primary_instance(f.replica_cid, &f.c2, &h.opts, &h.cancel)
        .unwrap();
    h.fleet.force_offline(&f.c1);
    h.orch
        .rejoin_instance(f.replica_cid, &f.c1, &h.opts, &h.cancel)
        .unwrap();

    assert_eq!(h.fleet.node_role(&f.c1), Some(InstanceRole::Secondary));
    assert_eq!(h.fleet.channel_source(&f.c2).as_ref(), Some(&f.a1));
    assert!(h.fleet.channel_running(&f.c2));
}
