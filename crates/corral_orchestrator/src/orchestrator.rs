//! The topology orchestrator: cluster lifecycle operations.
//!
//! Every operation is a single flow over explicit parameters — no ambient
//! "current cluster" context — and follows the same template:
//!
//! 1. **load**: begin a [`MetadataTxn`] and probe the affected instances
//! 2. **validate**: check preconditions; nothing has been mutated yet
//! 3. **execute**: remote mutations in documented order
//! 4. **converge**: poll the probe until intent is observed, bounded
//! 5. **commit**: optimistic metadata write; `VersionConflict` means a
//!    concurrent operation won and the caller must reload and retry
//! 6. **report**: an [`Outcome`] with warnings separate from failures
//!
//! Failures carry the phase they occurred in. A failure before `execute`
//! is always safe to retry; a failure after names exactly which steps
//! completed when the orchestrator cannot undo them safely.
//!
//! Cluster-set operations live in the sibling `cluster_set_ops` module;
//! read-only status/rescan reports in `report`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use corral_common::types::{ClusterId, CredentialRef, Endpoint};
use corral_common::{
    CancelToken, CorralError, CorralResult, OpPhase, OrchestratorConfig,
};
use corral_topology::gtid::HistoryRelation;
use corral_topology::model::{Cluster, Instance, InstanceRole, InstanceState, TopologyMode};
use corral_topology::store::{MetadataStore, MetadataTxn, TopologyDelta};

use crate::channel::ChannelConfigurator;
use crate::convergence::Convergence;
use crate::event_log::{EventSeverity, TopologyEventLog};
use crate::outcome::{OpError, OpOptions, OpResult, Outcome, PhaseExt, Warning};
use crate::probe::{InstanceProbe, ProbeReading};
use crate::quorum::QuorumEvaluator;
use crate::session::{AdminCommand, CommandOutput, ConnectionProvider, Session};

/// Orchestrates cluster and cluster-set lifecycle operations.
pub struct Orchestrator {
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) probe: Arc<dyn InstanceProbe>,
    pub(crate) provider: Arc<dyn ConnectionProvider>,
    pub(crate) config: OrchestratorConfig,
    pub(crate) admin_credential: CredentialRef,
    pub(crate) events: Arc<TopologyEventLog>,
    account_seq: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        probe: Arc<dyn InstanceProbe>,
        provider: Arc<dyn ConnectionProvider>,
        config: OrchestratorConfig,
        admin_credential: CredentialRef,
    ) -> Self {
        Self {
            store,
            probe,
            provider,
            config,
            admin_credential,
            events: TopologyEventLog::new(1024),
            account_seq: AtomicU64::new(1),
        }
    }

    /// The structured event log of operation phase transitions.
    pub fn event_log(&self) -> Arc<TopologyEventLog> {
        self.events.clone()
    }

    // ── Shared plumbing ─────────────────────────────────────────────────

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.convergence.poll_interval_ms)
    }

    pub(crate) fn op_timeout(&self, opts: &OpOptions) -> Duration {
        opts.timeout
            .unwrap_or(Duration::from_millis(self.config.convergence.timeout_ms))
    }

    pub(crate) fn sync_timeout(&self, opts: &OpOptions) -> Duration {
        opts.timeout
            .unwrap_or(Duration::from_millis(self.config.convergence.sync_timeout_ms))
    }

    pub(crate) fn recovery_timeout(&self, opts: &OpOptions) -> Duration {
        opts.timeout
            .unwrap_or(Duration::from_millis(self.config.recovery.recovery_timeout_ms))
    }

    pub(crate) fn convergence<'a>(
        &'a self,
        cancel: &'a CancelToken,
        timeout: Duration,
    ) -> Convergence<'a> {
        Convergence::new(self.probe.as_ref(), self.poll_interval(), timeout, cancel)
    }

    pub(crate) fn configurator(&self, timeout: Duration) -> ChannelConfigurator<'_> {
        ChannelConfigurator::new(
            self.provider.as_ref(),
            self.probe.as_ref(),
            &self.admin_credential,
            self.config.channel.connect_retry_secs,
            self.poll_interval(),
            timeout,
        )
    }

    pub(crate) fn evaluator(&self) -> QuorumEvaluator<'_> {
        QuorumEvaluator::new(self.probe.as_ref())
    }

    pub(crate) fn open(&self, endpoint: &Endpoint) -> CorralResult<Box<dyn Session>> {
        self.provider.open(endpoint, &self.admin_credential)
    }

    pub(crate) fn event(
        &self,
        operation: &str,
        phase: OpPhase,
        cluster: Option<ClusterId>,
        message: impl Into<String>,
    ) {
        self.events
            .log(operation, Some(phase), EventSeverity::Info, cluster, message);
    }

    /// Mint a fresh recovery/replication account name.
    pub(crate) fn mint_account(&self) -> String {
        let seq = self.account_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.config.recovery.account_prefix, seq)
    }

    /// Provision a recovery account on `on` and return its credential.
    pub(crate) fn provision_account(
        &self,
        on: &Endpoint,
        account: &str,
    ) -> CorralResult<CredentialRef> {
        let mut session = self.open(on)?;
        match session.execute(AdminCommand::CreateRecoveryAccount {
            account: account.to_string(),
        })? {
            CommandOutput::Credential(cred) => Ok(cred),
            CommandOutput::Done => Ok(CredentialRef(account.to_string())),
        }
    }

    /// Drop an account, tolerating failure (the caller records a warning).
    pub(crate) fn drop_account_best_effort(
        &self,
        on: &Endpoint,
        account: &str,
        warnings: &mut Vec<Warning>,
    ) {
        let result = self.open(on).and_then(|mut s| {
            s.execute(AdminCommand::DropRecoveryAccount {
                account: account.to_string(),
            })
        });
        if let Err(e) = result {
            warnings.push(Warning(format!(
                "could not drop account '{account}' on {on}: {e}; drop it manually"
            )));
        }
    }

    /// Execute one command of a multi-step mutation sequence. Once at
    /// least one step has completed, a later failure is reported as
    /// `PartialFailure` naming the steps already done, because the
    /// orchestrator cannot safely undo them.
    pub(crate) fn run_step(
        &self,
        session: &mut dyn Session,
        command: AdminCommand,
        completed: &mut Vec<String>,
    ) -> CorralResult<()> {
        let step = command.name();
        match session.execute(command) {
            Ok(_) => {
                completed.push(step.to_string());
                Ok(())
            }
            Err(e) if completed.is_empty() => Err(e),
            Err(e) => Err(CorralError::PartialFailure {
                completed: completed.clone(),
                failed_step: step.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Find the live ONLINE primary among `cluster`'s members.
    pub(crate) fn live_primary(&self, cluster: &Cluster) -> CorralResult<(Endpoint, ProbeReading)> {
        for member in &cluster.members {
            if let Ok(reading) = self.probe.read_state(&member.endpoint) {
                if reading.role == InstanceRole::Primary && reading.is_online() {
                    return Ok((member.endpoint.clone(), reading));
                }
            }
        }
        Err(CorralError::PreconditionFailed(format!(
            "cluster '{}' has no ONLINE primary",
            cluster.name
        )))
    }

    /// Poll `members` until one of them reports itself ONLINE PRIMARY.
    pub(crate) fn converge_primary(
        &self,
        members: &[Endpoint],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> CorralResult<(Endpoint, ProbeReading)> {
        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(CorralError::Cancelled(
                    cancel.reason().unwrap_or_else(|| "primary election".into()),
                ));
            }
            for endpoint in members {
                if let Ok(reading) = self.probe.read_state(endpoint) {
                    if reading.role == InstanceRole::Primary && reading.is_online() {
                        return Ok((endpoint.clone(), reading));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(CorralError::SyncTimeout {
                    endpoint: members
                        .first()
                        .cloned()
                        .unwrap_or_else(|| Endpoint::new("none", 0)),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            if cancel.wait_timeout(self.poll_interval()) {
                return Err(CorralError::Cancelled(
                    cancel.reason().unwrap_or_else(|| "primary election".into()),
                ));
            }
        }
    }

    /// Refresh a metadata cluster's member roles/states from live probes.
    /// Unreachable members keep their recorded applied set and are marked
    /// UNREACHABLE/MISSING.
    pub(crate) fn refresh_members(&self, cluster: &mut Cluster) {
        for member in &mut cluster.members {
            match self.probe.read_state(&member.endpoint) {
                Ok(reading) => {
                    member.role = reading.role;
                    member.state = reading.state;
                    member.applied_set = reading.applied_set;
                    member.read_only = reading.read_only;
                }
                Err(_) => {
                    member.role = InstanceRole::Unreachable;
                    member.state = InstanceState::Missing;
                }
            }
        }
    }

    // ── createCluster ───────────────────────────────────────────────────

    /// Initialize a new single-instance cluster on `seed`.
    ///
    /// All-or-nothing: a failure in any phase leaves no partial metadata.
    pub fn create_cluster(
        &self,
        name: &str,
        seed: &Endpoint,
        mode: TopologyMode,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> OpResult<ClusterId> {
        const OP: &str = "create_cluster";
        self.event(OP, OpPhase::Validate, None, format!("creating '{name}' on {seed}"));

        let mut txn = MetadataTxn::begin(self.store.as_ref());

        // validate
        if txn.snapshot().clusters.values().any(|c| c.name == name) {
            return Err(CorralError::PreconditionFailed(format!(
                "a cluster named '{name}' already exists"
            )))
            .in_phase(OpPhase::Validate);
        }
        if let Some(owner) = txn.snapshot().cluster_of_endpoint(seed) {
            return Err(CorralError::PreconditionFailed(format!(
                "{seed} is already a member of cluster '{}'",
                owner.name
            )))
            .in_phase(OpPhase::Validate);
        }
        let reading = self.probe.read_state(seed).in_phase(OpPhase::Validate)?;
        if reading.is_online() {
            return Err(CorralError::PreconditionFailed(format!(
                "{seed} is already part of a running replication group"
            )))
            .in_phase(OpPhase::Validate);
        }

        if opts.dry_run {
            let mut out = Outcome::new(txn.snapshot().next_cluster_id());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // execute
        self.event(OP, OpPhase::Execute, None, "bootstrapping replication group");
        let mut session = self.open(seed).in_phase(OpPhase::Execute)?;
        session
            .execute(AdminCommand::BootstrapGroup)
            .in_phase(OpPhase::Execute)?;
        drop(session);

        // converge
        let conv = self.convergence(cancel, self.op_timeout(opts));
        let reading = conv
            .wait_until(seed, "seed ONLINE as PRIMARY", |r| {
                r.role == InstanceRole::Primary && r.is_online()
            })
            .in_phase(OpPhase::Converge)?;

        // commit
        let id = txn.snapshot().next_cluster_id();
        let mut cluster = Cluster::new(id, name, mode);
        cluster.members.push(Instance {
            id: reading.instance_id.clone(),
            endpoint: seed.clone(),
            role: InstanceRole::Primary,
            state: InstanceState::Online,
            applied_set: reading.applied_set.clone(),
            read_only: false,
            recovery_account: None,
        });
        txn.stage(TopologyDelta::PutCluster(cluster));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(OP, OpPhase::Commit, Some(id), format!("cluster '{name}' created"));
        Ok(Outcome::new(id))
    }

    // ── addInstance ─────────────────────────────────────────────────────

    /// Join `target` to an existing cluster as a secondary.
    ///
    /// Metadata is not updated until the target is confirmed ONLINE; a
    /// recovery timeout surfaces as a retryable error.
    pub fn add_instance(
        &self,
        cluster_id: ClusterId,
        target: &Endpoint,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> OpResult<()> {
        const OP: &str = "add_instance";
        self.event(OP, OpPhase::Validate, Some(cluster_id), format!("adding {target}"));

        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let cluster = txn
            .snapshot()
            .cluster(cluster_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        // validate
        if let Some(owner) = txn.snapshot().cluster_of_endpoint(target) {
            return Err(CorralError::PreconditionFailed(format!(
                "{target} is already a member of cluster '{}'",
                owner.name
            )))
            .in_phase(OpPhase::Validate);
        }
        self.probe.read_state(target).in_phase(OpPhase::Validate)?;
        if !opts.force && !self.evaluator().has_quorum(&cluster) {
            return Err(CorralError::PreconditionFailed(format!(
                "cluster '{}' does not have quorum",
                cluster.name
            )))
            .in_phase(OpPhase::Validate);
        }
        let (primary_ep, _) = self.live_primary(&cluster).in_phase(OpPhase::Validate)?;

        if opts.dry_run {
            let mut out = Outcome::new(());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // execute: provision credentials, then join.
        let mut completed: Vec<String> = Vec::new();
        let account = self.mint_account();
        self.event(
            OP,
            OpPhase::Execute,
            Some(cluster_id),
            format!("provisioning recovery account '{account}'"),
        );
        let credential = self
            .provision_account(&primary_ep, &account)
            .in_phase(OpPhase::Execute)?;
        completed.push(format!("create_recovery_account({account})"));

        let join = self.open(target).and_then(|mut s| {
            s.execute(AdminCommand::JoinGroup {
                seed: primary_ep.clone(),
                credential,
                method: opts.recovery_method,
            })
        });
        if let Err(e) = join {
            return Err(OpError::new(
                OpPhase::Execute,
                CorralError::PartialFailure {
                    completed,
                    failed_step: "join_group".into(),
                    reason: e.to_string(),
                },
            ));
        }
        completed.push("join_group".into());

        // converge: recovery may legitimately take minutes.
        self.event(OP, OpPhase::Converge, Some(cluster_id), "waiting for recovery");
        let conv = self.convergence(cancel, self.recovery_timeout(opts));
        let reading = conv
            .wait_until(target, "target ONLINE as SECONDARY", |r| {
                r.is_online() && r.role == InstanceRole::Secondary
            })
            .in_phase(OpPhase::Converge)?;

        let mut warnings = Vec::new();
        if !reading.auto_start_enabled() {
            let fix = self
                .open(target)
                .and_then(|mut s| s.execute(AdminCommand::SetAutoStart { enabled: true }));
            match fix {
                Ok(_) => warnings.push(Warning(format!(
                    "auto-start was disabled on {target}; corrected"
                ))),
                Err(e) => warnings.push(Warning(format!(
                    "auto-start is disabled on {target} and could not be corrected: {e}"
                ))),
            }
        }

        // commit
        let mut updated = cluster;
        updated.members.push(Instance {
            id: reading.instance_id.clone(),
            endpoint: target.clone(),
            role: InstanceRole::Secondary,
            state: InstanceState::Online,
            applied_set: reading.applied_set.clone(),
            read_only: true,
            recovery_account: Some(account),
        });
        updated.view_change_id += 1;
        txn.stage(TopologyDelta::PutCluster(updated));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(OP, OpPhase::Commit, Some(cluster_id), format!("{target} added"));
        Ok(Outcome::with_warnings((), warnings))
    }

    // ── removeInstance ──────────────────────────────────────────────────

    /// Remove `target` from its cluster.
    ///
    /// Idempotent: removing an instance already absent from metadata is a
    /// no-op success. If the target is a replica cluster's primary, it is
    /// first synced against the cluster set's primary so no committed
    /// transaction is lost; diverged histories abort.
    pub fn remove_instance(
        &self,
        cluster_id: ClusterId,
        target: &Endpoint,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> OpResult<()> {
        const OP: &str = "remove_instance";
        self.event(OP, OpPhase::Validate, Some(cluster_id), format!("removing {target}"));

        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let cluster = txn
            .snapshot()
            .cluster(cluster_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        // validate
        let Some(member) = cluster.member(target).cloned() else {
            let mut out = Outcome::new(());
            out.push_warning(format!(
                "{target} is not a member of cluster '{}'; nothing to do",
                cluster.name
            ));
            return Ok(out);
        };
        if !opts.force && !self.evaluator().has_quorum(&cluster) {
            return Err(CorralError::PreconditionFailed(format!(
                "cluster '{}' does not have quorum (pass force to override)",
                cluster.name
            )))
            .in_phase(OpPhase::Validate);
        }

        let set = txn.snapshot().set_of_cluster(cluster_id).cloned();
        let channel = txn.snapshot().channels.get(&cluster_id).cloned();
        let is_replica_subscriber = channel
            .as_ref()
            .is_some_and(|ch| &ch.subscriber == target);
        let was_cluster_primary = cluster
            .primary()
            .is_some_and(|p| &p.endpoint == target);
        let is_set_primary_member = set
            .as_ref()
            .is_some_and(|s| s.primary_cluster == cluster_id);

        if opts.dry_run {
            let mut out = Outcome::new(());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // execute
        let mut completed: Vec<String> = Vec::new();
        let mut warnings: Vec<Warning> = Vec::new();

        // Consistency gate: a replica cluster's subscriber must have
        // applied everything the set primary had before the link is
        // severed.
        if is_replica_subscriber {
            if let Some(set) = &set {
                let primary_cluster = txn
                    .snapshot()
                    .cluster(set.primary_cluster)
                    .in_phase(OpPhase::Execute)?
                    .clone();
                let (source_ep, _) = self
                    .live_primary(&primary_cluster)
                    .in_phase(OpPhase::Execute)?;
                self.event(
                    OP,
                    OpPhase::Execute,
                    Some(cluster_id),
                    format!("syncing {target} against cluster set primary {source_ep}"),
                );
                self.evaluator()
                    .wait_for_sync(
                        &source_ep,
                        target,
                        self.sync_timeout(opts),
                        self.poll_interval(),
                        cancel,
                    )
                    .in_phase(OpPhase::Execute)?;
                completed.push("wait_for_sync".into());
            }
        }

        let target_reachable = self.probe.read_state(target).is_ok();
        if target_reachable {
            let mut session = self.open(target).in_phase(OpPhase::Execute)?;
            if let Some(ch) = &channel {
                if is_replica_subscriber {
                    self.run_step(
                        session.as_mut(),
                        AdminCommand::StopChannel { name: ch.name.clone() },
                        &mut completed,
                    )
                    .in_phase(OpPhase::Execute)?;
                    self.run_step(
                        session.as_mut(),
                        AdminCommand::ResetChannel { name: ch.name.clone() },
                        &mut completed,
                    )
                    .in_phase(OpPhase::Execute)?;
                }
            }
            self.run_step(session.as_mut(), AdminCommand::LeaveGroup, &mut completed)
                .in_phase(OpPhase::Execute)?;
            if set.is_some() {
                self.run_step(
                    session.as_mut(),
                    AdminCommand::ClearClusterSetSettings,
                    &mut completed,
                )
                .in_phase(OpPhase::Execute)?;
            }
        } else if opts.force {
            warnings.push(Warning(format!(
                "{target} is unreachable; removed from metadata only, run a rescan \
                 once it is back"
            )));
        } else {
            return Err(CorralError::Connect {
                endpoint: target.clone(),
                reason: "target unreachable; pass force to remove from metadata anyway".into(),
            })
            .in_phase(OpPhase::Execute);
        }

        let mut updated = cluster;
        updated.remove_member(target);
        updated.view_change_id += 1;

        // Drop the removed member's recovery account and rotate channel
        // credentials so captured secrets cannot resume replication.
        if !updated.members.is_empty() {
            if let Ok((primary_ep, _)) = self.live_primary(&updated) {
                if let Some(account) = &member.recovery_account {
                    self.drop_account_best_effort(&primary_ep, account, &mut warnings);
                }
            }
        }

        // converge: remaining members must stop counting the target.
        if target_reachable {
            let witness = updated
                .members
                .iter()
                .map(|m| m.endpoint.clone())
                .find(|ep| self.probe.read_state(ep).is_ok());
            if let Some(witness) = witness {
                let conv = self.convergence(cancel, self.op_timeout(opts));
                conv.wait_until(&witness, "membership excludes removed instance", |r| {
                    !r.peers_online.contains(target)
                })
                .in_phase(OpPhase::Converge)?;
            }
        }

        // A removed primary triggers election among the remaining members;
        // replica channels follow the new endpoints.
        if was_cluster_primary && !updated.members.is_empty() {
            let members: Vec<Endpoint> =
                updated.members.iter().map(|m| m.endpoint.clone()).collect();
            let (new_primary, _) = self
                .converge_primary(&members, self.op_timeout(opts), cancel)
                .in_phase(OpPhase::Converge)?;
            self.event(
                OP,
                OpPhase::Converge,
                Some(cluster_id),
                format!("{new_primary} took over as primary"),
            );

            if is_replica_subscriber {
                // Trigger (ii): the new primary takes over the subscriber
                // role of this replica cluster's channel.
                if let Some(mut ch) = channel.clone() {
                    ch.subscriber = new_primary.clone();
                    self.rotate_channel_credential(&mut ch, &mut warnings)
                        .in_phase(OpPhase::Converge)?;
                    self.configurator(self.op_timeout(opts))
                        .apply(&ch, cancel)
                        .in_phase(OpPhase::Converge)?;
                    txn.stage(TopologyDelta::PutChannel(ch));
                }
            }
            if is_set_primary_member {
                // Trigger (i): every replica cluster must repoint at the
                // primary cluster's new primary. The removed node was the
                // old source and holds the channel credentials, so they
                // are rotated as well.
                if let Some(set) = &set {
                    self.repoint_set_channels(&mut txn, set.id, &new_primary, opts, cancel)
                        .in_phase(OpPhase::Converge)?;
                    self.rotate_set_credentials(&mut txn, set.id, &mut warnings, opts, cancel)
                        .in_phase(OpPhase::Converge)?;
                }
            }
        } else if let Some(set) = &set {
            // Removing a secondary from a set member cluster: rotate the
            // set's channel credentials defensively so the removed node's
            // captured secrets cannot resume replication.
            if !is_replica_subscriber && !updated.members.is_empty() {
                self.rotate_set_credentials(&mut txn, set.id, &mut warnings, opts, cancel)
                    .in_phase(OpPhase::Converge)?;
            }
        }

        // commit
        self.refresh_members(&mut updated);
        txn.stage(TopologyDelta::PutCluster(updated));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(OP, OpPhase::Commit, Some(cluster_id), format!("{target} removed"));
        Ok(Outcome::with_warnings((), warnings))
    }

    // ── setPrimaryInstance ──────────────────────────────────────────────

    /// Elect `candidate` as the cluster's primary.
    ///
    /// Aborts before any metadata mutation if the election itself fails.
    /// If the cluster is a replica cluster, its channel follows the new
    /// primary; if it is the set's primary cluster, every replica
    /// cluster's channel is repointed.
    pub fn set_primary_instance(
        &self,
        cluster_id: ClusterId,
        candidate: &Endpoint,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> OpResult<()> {
        const OP: &str = "set_primary_instance";
        self.event(
            OP,
            OpPhase::Validate,
            Some(cluster_id),
            format!("switching primary to {candidate}"),
        );

        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let cluster = txn
            .snapshot()
            .cluster(cluster_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        // validate
        if cluster.mode != TopologyMode::SinglePrimary {
            return Err(CorralError::PreconditionFailed(format!(
                "cluster '{}' is multi-primary; there is no primary to switch",
                cluster.name
            )))
            .in_phase(OpPhase::Validate);
        }
        if !cluster.has_member(candidate) {
            return Err(CorralError::PreconditionFailed(format!(
                "{candidate} is not a member of cluster '{}'",
                cluster.name
            )))
            .in_phase(OpPhase::Validate);
        }
        let candidate_reading = self.probe.read_state(candidate).in_phase(OpPhase::Validate)?;
        if !candidate_reading.is_online() {
            return Err(CorralError::PreconditionFailed(format!(
                "{candidate} is {}; the new primary must be ONLINE",
                candidate_reading.state
            )))
            .in_phase(OpPhase::Validate);
        }
        let (old_primary, primary_reading) =
            self.live_primary(&cluster).in_phase(OpPhase::Validate)?;
        if &old_primary == candidate {
            let mut out = Outcome::new(());
            out.push_warning(format!("{candidate} is already the primary; nothing to do"));
            return Ok(out);
        }
        match candidate_reading
            .applied_set
            .relation(&primary_reading.applied_set)
        {
            HistoryRelation::Diverged => {
                return Err(CorralError::Diverged {
                    a: primary_reading.applied_set.to_string(),
                    b: candidate_reading.applied_set.to_string(),
                })
                .in_phase(OpPhase::Validate);
            }
            HistoryRelation::Ahead => {
                // A candidate ahead of the primary would mean writes
                // outside the group.
                return Err(CorralError::PreconditionFailed(format!(
                    "{candidate} has transactions the current primary lacks"
                )))
                .in_phase(OpPhase::Validate);
            }
            HistoryRelation::Equal | HistoryRelation::Behind => {}
        }

        if opts.dry_run {
            let mut out = Outcome::new(());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // execute: the election runs on the current primary.
        let mut session = self.open(&old_primary).in_phase(OpPhase::Execute)?;
        session
            .execute(AdminCommand::ElectPrimary {
                candidate: candidate_reading.instance_id.clone(),
            })
            .in_phase(OpPhase::Execute)?;
        drop(session);

        // converge
        let conv = self.convergence(cancel, self.op_timeout(opts));
        conv.wait_until(candidate, "candidate is PRIMARY", |r| {
            r.role == InstanceRole::Primary && r.is_online()
        })
        .in_phase(OpPhase::Converge)?;
        conv.wait_until(&old_primary, "old primary demoted", |r| {
            r.role == InstanceRole::Secondary
        })
        .in_phase(OpPhase::Converge)?;

        let mut warnings = Vec::new();
        let set = txn.snapshot().set_of_cluster(cluster_id).cloned();
        match &set {
            Some(set) if set.primary_cluster == cluster_id => {
                // Trigger (i): replica channels follow the new source.
                self.repoint_set_channels(&mut txn, set.id, candidate, opts, cancel)
                    .in_phase(OpPhase::Converge)?;
            }
            Some(_) => {
                // Trigger (ii): this replica cluster's subscriber moved.
                if let Some(mut ch) = txn.snapshot().channels.get(&cluster_id).cloned() {
                    let cfg = self.configurator(self.op_timeout(opts));
                    if let Err(e) = cfg.teardown(&old_primary, &ch) {
                        warnings.push(Warning(format!(
                            "could not clear stale channel on {old_primary}: {e}"
                        )));
                    }
                    ch.subscriber = candidate.clone();
                    cfg.apply(&ch, cancel).in_phase(OpPhase::Converge)?;
                    txn.stage(TopologyDelta::PutChannel(ch));
                }
            }
            None => {}
        }

        // commit
        let mut updated = cluster;
        self.refresh_members(&mut updated);
        updated.view_change_id += 1;
        txn.stage(TopologyDelta::PutCluster(updated));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(
            OP,
            OpPhase::Commit,
            Some(cluster_id),
            format!("primary switched to {candidate}"),
        );
        Ok(Outcome::with_warnings((), warnings))
    }

    // ── rejoinInstance ──────────────────────────────────────────────────

    /// Bring a previously-member instance back into its group.
    ///
    /// Surfaces non-fatal warnings when persisted auto-start settings had
    /// to be corrected. A diverged local history blocks the rejoin.
    pub fn rejoin_instance(
        &self,
        cluster_id: ClusterId,
        target: &Endpoint,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> OpResult<()> {
        const OP: &str = "rejoin_instance";
        self.event(OP, OpPhase::Validate, Some(cluster_id), format!("rejoining {target}"));

        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let cluster = txn
            .snapshot()
            .cluster(cluster_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        // validate
        let Some(member) = cluster.member(target).cloned() else {
            return Err(CorralError::PreconditionFailed(format!(
                "{target} is not listed in cluster '{}'; use add_instance",
                cluster.name
            )))
            .in_phase(OpPhase::Validate);
        };
        let reading = self.probe.read_state(target).in_phase(OpPhase::Validate)?;
        if reading.is_online() && !reading.peers_online.is_empty() {
            let mut out = Outcome::new(());
            out.push_warning(format!("{target} is already ONLINE; nothing to do"));
            return Ok(out);
        }
        let (primary_ep, primary_reading) =
            self.live_primary(&cluster).in_phase(OpPhase::Validate)?;
        if reading.applied_set.relation(&primary_reading.applied_set)
            == HistoryRelation::Diverged
        {
            return Err(CorralError::Diverged {
                a: primary_reading.applied_set.to_string(),
                b: reading.applied_set.to_string(),
            })
            .in_phase(OpPhase::Validate);
        }

        if opts.dry_run {
            let mut out = Outcome::new(());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // execute
        let mut warnings = Vec::new();
        if !reading.auto_start_enabled() {
            self.open(target)
                .and_then(|mut s| s.execute(AdminCommand::SetAutoStart { enabled: true }))
                .in_phase(OpPhase::Execute)?;
            warnings.push(Warning(format!(
                "auto-start was disabled on {target}; corrected"
            )));
        }

        let credential = match &member.recovery_account {
            Some(account) => CredentialRef(account.clone()),
            None => {
                let account = self.mint_account();
                self.provision_account(&primary_ep, &account)
                    .in_phase(OpPhase::Execute)?
            }
        };
        self.open(target)
            .and_then(|mut s| {
                s.execute(AdminCommand::JoinGroup {
                    seed: primary_ep.clone(),
                    credential,
                    method: opts.recovery_method,
                })
            })
            .in_phase(OpPhase::Execute)?;

        // converge
        let conv = self.convergence(cancel, self.recovery_timeout(opts));
        conv.wait_until(target, "instance ONLINE", |r| r.is_online())
            .in_phase(OpPhase::Converge)?;

        // Trigger (iii): a rejoined replica-cluster member may hold stale
        // channel state; reconcile against the current set source.
        if let Some(set) = txn.snapshot().set_of_cluster(cluster_id).cloned() {
            if set.primary_cluster != cluster_id {
                if let Some(mut ch) = txn.snapshot().channels.get(&cluster_id).cloned() {
                    let primary_cluster = txn
                        .snapshot()
                        .cluster(set.primary_cluster)
                        .in_phase(OpPhase::Converge)?
                        .clone();
                    let (source_ep, _) = self
                        .live_primary(&primary_cluster)
                        .in_phase(OpPhase::Converge)?;
                    let (subscriber_ep, _) = self
                        .live_primary(&cluster)
                        .in_phase(OpPhase::Converge)?;
                    if ch.source != source_ep || ch.subscriber != subscriber_ep {
                        ch.source = source_ep;
                        ch.subscriber = subscriber_ep;
                        self.configurator(self.op_timeout(opts))
                            .apply(&ch, cancel)
                            .in_phase(OpPhase::Converge)?;
                        txn.stage(TopologyDelta::PutChannel(ch));
                        warnings.push(Warning(
                            "replication channel was stale and has been repointed".into(),
                        ));
                    }
                }
            }
        }

        // commit
        let mut updated = cluster;
        self.refresh_members(&mut updated);
        txn.stage(TopologyDelta::PutCluster(updated));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(OP, OpPhase::Commit, Some(cluster_id), format!("{target} rejoined"));
        Ok(Outcome::with_warnings((), warnings))
    }

    // ── rebootClusterFromCompleteOutage ─────────────────────────────────

    /// Re-bootstrap a fully-offline cluster from `chosen`.
    ///
    /// Fatal if a reachable candidate's history diverges from the chosen
    /// instance; a candidate with strictly newer history requires `force`
    /// (or rebooting from that candidate instead).
    pub fn reboot_cluster_from_complete_outage(
        &self,
        cluster_id: ClusterId,
        chosen: &Endpoint,
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> OpResult<()> {
        const OP: &str = "reboot_cluster_from_complete_outage";
        self.event(
            OP,
            OpPhase::Validate,
            Some(cluster_id),
            format!("rebooting from {chosen}"),
        );

        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let cluster = txn
            .snapshot()
            .cluster(cluster_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        // validate
        if !cluster.has_member(chosen) {
            return Err(CorralError::PreconditionFailed(format!(
                "{chosen} is not a member of cluster '{}'",
                cluster.name
            )))
            .in_phase(OpPhase::Validate);
        }
        let chosen_reading = self.probe.read_state(chosen).in_phase(OpPhase::Validate)?;
        if chosen_reading.is_online() {
            return Err(CorralError::PreconditionFailed(format!(
                "{chosen} is already ONLINE; the cluster is not in complete outage"
            )))
            .in_phase(OpPhase::Validate);
        }

        let mut reachable_peers: Vec<(Endpoint, ProbeReading)> = Vec::new();
        for m in &cluster.members {
            if &m.endpoint == chosen {
                continue;
            }
            if let Ok(r) = self.probe.read_state(&m.endpoint) {
                if r.is_online() {
                    return Err(CorralError::PreconditionFailed(format!(
                        "{} is ONLINE; the cluster is not in complete outage",
                        m.endpoint
                    )))
                    .in_phase(OpPhase::Validate);
                }
                reachable_peers.push((m.endpoint.clone(), r));
            }
        }
        for (peer_ep, peer) in &reachable_peers {
            match chosen_reading.applied_set.relation(&peer.applied_set) {
                HistoryRelation::Diverged => {
                    return Err(CorralError::Diverged {
                        a: chosen_reading.applied_set.to_string(),
                        b: peer.applied_set.to_string(),
                    })
                    .in_phase(OpPhase::Validate);
                }
                HistoryRelation::Behind if !opts.force => {
                    return Err(CorralError::PreconditionFailed(format!(
                        "{peer_ep} has more recent history than {chosen}; reboot from it \
                         or pass force to discard its extra transactions"
                    )))
                    .in_phase(OpPhase::Validate);
                }
                _ => {}
            }
        }

        if opts.dry_run {
            let mut out = Outcome::new(());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // execute: re-bootstrap from the chosen instance.
        self.open(chosen)
            .and_then(|mut s| s.execute(AdminCommand::BootstrapGroup))
            .in_phase(OpPhase::Execute)?;

        let conv = self.convergence(cancel, self.op_timeout(opts));
        conv.wait_until(chosen, "chosen instance ONLINE as PRIMARY", |r| {
            r.role == InstanceRole::Primary && r.is_online()
        })
        .in_phase(OpPhase::Converge)?;

        // Rejoin the remaining reachable members; failures degrade to
        // warnings so the cluster still comes back around the survivor.
        let mut warnings = Vec::new();
        let account = self.mint_account();
        let credential = self
            .provision_account(chosen, &account)
            .in_phase(OpPhase::Execute)?;
        for (peer_ep, peer) in &reachable_peers {
            if chosen_reading
                .applied_set
                .relation(&peer.applied_set)
                == HistoryRelation::Behind
            {
                warnings.push(Warning(format!(
                    "{peer_ep} kept transactions discarded by the reboot; it must be \
                     re-provisioned before rejoining"
                )));
                continue;
            }
            let rejoined = self.open(peer_ep).and_then(|mut s| {
                s.execute(AdminCommand::JoinGroup {
                    seed: chosen.clone(),
                    credential: credential.clone(),
                    method: opts.recovery_method,
                })
            });
            match rejoined {
                Ok(_) => {
                    if let Err(e) = conv.wait_until(peer_ep, "member rejoined", |r| r.is_online())
                    {
                        warnings.push(Warning(format!(
                            "{peer_ep} did not come ONLINE after rejoin: {e}"
                        )));
                    }
                }
                Err(e) => warnings.push(Warning(format!("could not rejoin {peer_ep}: {e}"))),
            }
        }
        for m in &cluster.members {
            if &m.endpoint != chosen
                && !reachable_peers.iter().any(|(ep, _)| ep == &m.endpoint)
            {
                warnings.push(Warning(format!(
                    "{} is still unreachable; rejoin it once it is back",
                    m.endpoint
                )));
            }
        }

        // A rebooted set-primary cluster has a (possibly) new source
        // endpoint; replica channels must follow.
        if let Some(set) = txn.snapshot().set_of_cluster(cluster_id).cloned() {
            if set.primary_cluster == cluster_id {
                self.repoint_set_channels(&mut txn, set.id, chosen, opts, cancel)
                    .in_phase(OpPhase::Converge)?;
            } else if let Some(mut ch) = txn.snapshot().channels.get(&cluster_id).cloned() {
                if &ch.subscriber != chosen {
                    ch.subscriber = chosen.clone();
                    self.configurator(self.op_timeout(opts))
                        .apply(&ch, cancel)
                        .in_phase(OpPhase::Converge)?;
                    txn.stage(TopologyDelta::PutChannel(ch));
                }
            }
        }

        // commit
        let mut updated = cluster;
        self.refresh_members(&mut updated);
        updated.view_change_id += 1;
        txn.stage(TopologyDelta::PutCluster(updated));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(OP, OpPhase::Commit, Some(cluster_id), "cluster rebooted");
        Ok(Outcome::with_warnings((), warnings))
    }

    // ── forceQuorum ─────────────────────────────────────────────────────

    /// Narrow the expected membership to `survivors` after quorum loss.
    ///
    /// Never invoked implicitly: it risks split-brain reconciliation, so
    /// the operator must name the survivors. Survivors with mutually
    /// diverged histories abort the operation.
    pub fn force_quorum(
        &self,
        cluster_id: ClusterId,
        survivors: &[Endpoint],
        opts: &OpOptions,
        cancel: &CancelToken,
    ) -> OpResult<()> {
        const OP: &str = "force_quorum";
        self.event(
            OP,
            OpPhase::Validate,
            Some(cluster_id),
            format!("forcing quorum with {} survivors", survivors.len()),
        );

        let mut txn = MetadataTxn::begin(self.store.as_ref());
        let cluster = txn
            .snapshot()
            .cluster(cluster_id)
            .in_phase(OpPhase::Validate)?
            .clone();

        self.evaluator()
            .validate_force_quorum(&cluster, survivors)
            .in_phase(OpPhase::Validate)?;

        if opts.dry_run {
            let mut out = Outcome::new(());
            out.push_warning("dry run: preconditions satisfied, no changes made");
            return Ok(out);
        }

        // execute: one survivor re-forms the group for all of them.
        self.open(&survivors[0])
            .and_then(|mut s| {
                s.execute(AdminCommand::ForceMembership {
                    survivors: survivors.to_vec(),
                })
            })
            .in_phase(OpPhase::Execute)?;

        // converge: the narrowed group must elect a primary.
        let (new_primary, _) = self
            .converge_primary(survivors, self.op_timeout(opts), cancel)
            .in_phase(OpPhase::Converge)?;

        // commit: non-survivors stay in metadata, marked MISSING, until an
        // operator removes or rejoins them explicitly.
        let mut updated = cluster;
        self.refresh_members(&mut updated);
        updated.view_change_id += 1;
        let mut warnings = Vec::new();
        for m in &updated.members {
            if !survivors.contains(&m.endpoint) {
                warnings.push(Warning(format!(
                    "{} was fenced out; remove or rejoin it explicitly",
                    m.endpoint
                )));
            }
        }
        txn.stage(TopologyDelta::PutCluster(updated));
        txn.commit(self.store.as_ref()).in_phase(OpPhase::Commit)?;

        self.event(
            OP,
            OpPhase::Commit,
            Some(cluster_id),
            format!("quorum forced; {new_primary} is primary"),
        );
        Ok(Outcome::with_warnings((), warnings))
    }
}
