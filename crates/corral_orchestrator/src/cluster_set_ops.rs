//! Cluster-set lifecycle operations and channel maintenance helpers.
//!
//! A cluster set federates one primary cluster with replica clusters that
//! follow it over asynchronous replication channels. The helpers here
//! enforce the channel invariant shared by several operations: every
//! replica cluster's channel points at the current primary instance of
//! the current primary cluster, with a credential the removed nodes no
//! longer hold.

use corral_common::types::{ChannelName, ClusterId, ClusterSetId, Endpoint};
use corral_common::{CancelToken, CorralError, CorralResult, OpPhase};
use corral_topology::gtid::HistoryRelation;
use corral_topology::model::{
    Cluster, ClusterSet, Instance, InstanceRole, InstanceState, ReplicationChannel, TopologyMode,
};
use corral_topology::store::{MetadataTxn, TopologyDelta};

use crate::orchestrator::Orchestrator;
use crate::outcome::{OpOptions, OpResult, Outcome, PhaseExt, Warning};
use crate::session::AdminCommand;

impl Orchestrator {
    // ── Channel maintenance helpers ─────────────────────────────────────

    /// Repoint every replica cluster channel of `set_id` at `new_source`.
    /// Staged channel updates land in `txn`; callers commit.
    pub(crate) fn repoint_set_channels(
        &self,
        txn: &mut MetadataTxn,
        set_id: ClusterSetId,
        new_source: &Endpoint,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> CorralResult<()> {
        let set = txn.snapshot().cluster_set(set_id)?.clone();
        for cid in &set.replica_clusters {
            let Some(mut ch) = txn.snapshot().channels.get(cid).cloned() else {
                continue;
            };
            if &ch.source == new_source {
                continue;
            }
            tracing::info!(
                cluster = %cid, old = %ch.source, new = %new_source,
                "repointing replica cluster channel"
            );
            ch.source = new_source.clone();
            self.configurator(self.op_timeout(opts)).apply(&ch, cancel)?;
            txn.stage(TopologyDelta::PutChannel(ch));
        }
        Ok(())
    }

    /// Replace a channel's credential with a freshly provisioned account
    /// and drop the old one. The old credential may have been captured by
    /// a node that is being removed.
    pub(crate) fn rotate_channel_credential(
        &self,
        channel: &mut ReplicationChannel,
        warnings: &mut Vec<Warning>,
    ) -> CorralResult<()> {
        let account = self.mint_account();
        let old = channel.credential.clone();
        channel.credential = self.provision_account(&channel.source, &account)?;
        self.drop_account_best_effort(&channel.source, &old.0, warnings);
        Ok(())
    }

    /// Rotate credentials on every channel of `set_id` and re-apply them.
    pub(crate) fn rotate_set_credentials(
        &self,
        txn: &mut MetadataTxn,
        set_id: ClusterSetId,
        warnings: &mut Vec<Warning>,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> CorralResult<()> {
        let set = txn.snapshot().cluster_set(set_id)?.clone();
        for cid in &set.replica_clusters {
            let Some(mut ch) = txn.snapshot().channels.get(cid).cloned() else {
                continue;
            };
            self.rotate_channel_credential(&mut ch, warnings)?;
            self.configurator(self.op_timeout(opts)).apply(&ch, cancel)?;
            txn.stage(TopologyDelta::PutChannel(ch));
        }
        Ok(())
    }

    // ── createClusterSet ────────────────────────────────────────────────

    /// Promote a standalone, healthy, single-primary cluster into the
    /// primary cluster of a new cluster set.
    ///
    /// Metadata-only: no remote state changes until a replica cluster is
    /// created, so the commit is trivially all-or-nothing.
    pub fn create_cluster_set(
        &self,
        cluster_id: ClusterId,
        domain_name: &str,
        opts: &OpOptions,
        _cancel: &CancelToken,
    ) -> OpResult<ClusterSetId> {
        const OP: &str = "create_cluster_set";
        self.event(
            OP,
            OpPhase::Validate,
            Some(cluster_id),
            format!("creating cluster set '{domain_name}'"),
        );

        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let cluster = txn
            .snapshot()
            .cluster(cluster_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        // validate
        if let Some(existing) = txn.snapshot().set_of_cluster(cluster_id) {
            return Err(CorralError::PreconditionFailed(format!(
                "cluster '{}' already belongs to cluster set '{}'",
                cluster.name, existing.domain_name
            )))
            .in_phase(OpPhase::Validate);
        }
        if txn
            .snapshot()
            .cluster_sets
            .values()
            .any(|s| s.domain_name == domain_name)
        {
            return Err(CorralError::PreconditionFailed(format!(
                "a cluster set with domain '{domain_name}' already exists"
            )))
            .in_phase(OpPhase::Validate);
        }
        if cluster.mode != TopologyMode::SinglePrimary {
            return Err(CorralError::PreconditionFailed(format!(
                "cluster '{}' is multi-primary; a cluster set requires single-primary mode",
                cluster.name
            )))
            .in_phase(OpPhase::Validate);
        }
        if !self.evaluator().has_quorum(&cluster) {
            return Err(CorralError::PreconditionFailed(format!(
                "cluster '{}' does not have quorum",
                cluster.name
            )))
            .in_phase(OpPhase::Validate);
        }
        self.live_primary(&cluster).in_phase(OpPhase::Validate)?;

        if opts.dry_run {
            let mut out = Outcome::new(txn.snapshot().next_cluster_set_id());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // commit
        let set_id = txn.snapshot().next_cluster_set_id();
        txn.stage(TopologyDelta::PutClusterSet(ClusterSet::new(
            set_id,
            domain_name,
            cluster_id,
        )));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(
            OP,
            OpPhase::Commit,
            Some(cluster_id),
            format!("cluster set '{domain_name}' created"),
        );
        Ok(Outcome::new(set_id))
    }

    // ── createReplicaCluster ────────────────────────────────────────────

    /// Seed `target` from the set's primary, form a new single-instance
    /// cluster on it, and attach it to the set behind a replication
    /// channel.
    ///
    /// On seeding failure nothing is registered; the provisioned account
    /// is dropped best-effort.
    pub fn create_replica_cluster(
        &self,
        set_id: ClusterSetId,
        name: &str,
        target: &Endpoint,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> OpResult<ClusterId> {
        const OP: &str = "create_replica_cluster";
        self.event(
            OP,
            OpPhase::Validate,
            None,
            format!("creating replica cluster '{name}' on {target}"),
        );

        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let set = txn
            .snapshot()
            .cluster_set(set_id)
            .in_phase(OpPhase::Validate)?
            .clone();
        let primary_cluster = txn
            .snapshot()
            .cluster(set.primary_cluster)
            .in_phase(OpPhase::Validate)?
            .clone();

        // validate
        if txn.snapshot().clusters.values().any(|c| c.name == name) {
            return Err(CorralError::PreconditionFailed(format!(
                "a cluster named '{name}' already exists"
            )))
            .in_phase(OpPhase::Validate);
        }
        if let Some(owner) = txn.snapshot().cluster_of_endpoint(target) {
            return Err(CorralError::PreconditionFailed(format!(
                "{target} is already a member of cluster '{}'",
                owner.name
            )))
            .in_phase(OpPhase::Validate);
        }
        let reading = self.probe.read_state(target).in_phase(OpPhase::Validate)?;
        if reading.is_online() {
            return Err(CorralError::PreconditionFailed(format!(
                "{target} is already part of a running replication group"
            )))
            .in_phase(OpPhase::Validate);
        }
        let (source_ep, source_reading) = self
            .live_primary(&primary_cluster)
            .in_phase(OpPhase::Validate)?;
        if reading.applied_set.relation(&source_reading.applied_set) == HistoryRelation::Diverged {
            return Err(CorralError::Diverged {
                a: source_reading.applied_set.to_string(),
                b: reading.applied_set.to_string(),
            })
            .in_phase(OpPhase::Validate);
        }

        if opts.dry_run {
            let mut out = Outcome::new(txn.snapshot().next_cluster_id());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // execute: account, seed, bootstrap. A seed failure rolls back to
        // nothing registered.
        let account = self.mint_account();
        let credential = self
            .provision_account(&source_ep, &account)
            .in_phase(OpPhase::Execute)?;

        self.event(
            OP,
            OpPhase::Execute,
            None,
            format!("seeding {target} from {source_ep}"),
        );
        let seeded = self.open(target).and_then(|mut s| {
            s.execute(AdminCommand::SeedFrom {
                source: source_ep.clone(),
                method: opts.recovery_method,
            })
        });
        if let Err(e) = seeded {
            let mut discarded = Vec::new();
            self.drop_account_best_effort(&source_ep, &account, &mut discarded);
            for w in discarded {
                tracing::warn!("rollback of replica cluster seeding: {w}");
            }
            return Err(e).in_phase(OpPhase::Execute);
        }
        self.evaluator()
            .wait_for_sync(
                &source_ep,
                target,
                self.recovery_timeout(opts),
                self.poll_interval(),
                cancel,
            )
            .in_phase(OpPhase::Execute)?;

        self.open(target)
            .and_then(|mut s| s.execute(AdminCommand::BootstrapGroup))
            .in_phase(OpPhase::Execute)?;

        // converge: group up, then channel applying.
        let conv = self.convergence(cancel, self.op_timeout(opts));
        let reading = conv
            .wait_until(target, "replica cluster ONLINE", |r| {
                r.role == InstanceRole::Primary && r.is_online()
            })
            .in_phase(OpPhase::Converge)?;

        let cluster_id = txn.snapshot().next_cluster_id();
        let channel = ReplicationChannel {
            name: ChannelName(self.config.channel.name.clone()),
            cluster: cluster_id,
            source: source_ep.clone(),
            subscriber: target.clone(),
            credential,
            applier_delay_secs: self.config.channel.applier_delay_secs,
        };
        self.configurator(self.op_timeout(opts))
            .apply(&channel, cancel)
            .in_phase(OpPhase::Converge)?;

        // commit
        let mut cluster = Cluster::new(cluster_id, name, TopologyMode::SinglePrimary);
        cluster.members.push(Instance {
            id: reading.instance_id.clone(),
            endpoint: target.clone(),
            role: InstanceRole::Primary,
            state: InstanceState::Online,
            applied_set: reading.applied_set.clone(),
            read_only: false,
            recovery_account: None,
        });
        let mut updated_set = set;
        updated_set.replica_clusters.push(cluster_id);
        txn.stage(TopologyDelta::PutCluster(cluster));
        txn.stage(TopologyDelta::PutClusterSet(updated_set));
        txn.stage(TopologyDelta::PutChannel(channel));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(
            OP,
            OpPhase::Commit,
            Some(cluster_id),
            format!("replica cluster '{name}' attached"),
        );
        Ok(Outcome::new(cluster_id))
    }

    // ── removeCluster ───────────────────────────────────────────────────

    /// Detach a replica cluster from its set; it keeps running standalone.
    ///
    /// Idempotent: detaching a cluster that is already standalone is a
    /// no-op success. The set's primary cluster cannot be detached.
    pub fn remove_cluster(
        &self,
        set_id: ClusterSetId,
        cluster_id: ClusterId,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> OpResult<()> {
        const OP: &str = "remove_cluster";
        self.event(
            OP,
            OpPhase::Validate,
            Some(cluster_id),
            "detaching cluster from its set",
        );

        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let set = txn
            .snapshot()
            .cluster_set(set_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        // validate
        if !set.contains(cluster_id) {
            let mut out = Outcome::new(());
            out.push_warning(format!(
                "cluster {cluster_id} is not part of cluster set '{}'; nothing to do",
                set.domain_name
            ));
            return Ok(out);
        }
        if set.primary_cluster == cluster_id {
            return Err(CorralError::PreconditionFailed(format!(
                "cluster {cluster_id} is the primary cluster of '{}'; only replica \
                 clusters can be detached",
                set.domain_name
            )))
            .in_phase(OpPhase::Validate);
        }
        let cluster = txn
            .snapshot()
            .cluster(cluster_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        if opts.dry_run {
            let mut out = Outcome::new(());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // execute: tear down the channel, strip set settings everywhere.
        let mut warnings: Vec<Warning> = Vec::new();
        let channel = txn.snapshot().channels.get(&cluster_id).cloned();
        if let Some(ch) = &channel {
            match self.configurator(self.op_timeout(opts)).teardown(&ch.subscriber, ch) {
                Ok(()) => {}
                Err(CorralError::Connect { .. }) if opts.force => {
                    warnings.push(Warning(format!(
                        "{} is unreachable; channel left configured on it",
                        ch.subscriber
                    )));
                }
                Err(e) => return Err(e).in_phase(OpPhase::Execute),
            }

            // Drop the channel account on the source so the detached
            // cluster cannot reattach itself.
            self.drop_account_best_effort(&ch.source, &ch.credential.0, &mut warnings);
        }
        for member in &cluster.members {
            let cleared = self
                .open(&member.endpoint)
                .and_then(|mut s| s.execute(AdminCommand::ClearClusterSetSettings));
            if let Err(e) = cleared {
                warnings.push(Warning(format!(
                    "could not clear cluster set settings on {}: {e}",
                    member.endpoint
                )));
            }
        }

        // converge: the subscriber must no longer report the channel.
        if let Some(ch) = &channel {
            if self.probe.read_state(&ch.subscriber).is_ok() {
                let conv = self.convergence(cancel, self.op_timeout(opts));
                conv.wait_until(&ch.subscriber, "channel removed", |r| {
                    !r.channels.contains_key(&ch.name.0)
                })
                .in_phase(OpPhase::Converge)?;
            }
        }

        // commit
        let mut updated_set = set;
        updated_set.replica_clusters.retain(|c| *c != cluster_id);
        txn.stage(TopologyDelta::DropChannel(cluster_id));
        txn.stage(TopologyDelta::PutClusterSet(updated_set));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(OP, OpPhase::Commit, Some(cluster_id), "cluster detached");
        Ok(Outcome::with_warnings((), warnings))
    }
}
