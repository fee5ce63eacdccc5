//! In-process simulated fleet.
//!
//! Implements [`ConnectionProvider`] and [`InstanceProbe`] over a set of
//! fake nodes with real group semantics: joins recover over a configurable
//! number of ticks, secondaries catch up to their primary, a group that
//! loses its primary elects the most-advanced online member, and channels
//! pull the source's applied set into the subscriber. Time advances on
//! observation — every probe read runs one tick — so tests are
//! deterministic and never sleep to make progress.
//!
//! Reachability is a per-node switch; an unreachable node fails probes and
//! session opens with `Connect`, exactly like a dead host.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use corral_common::types::{ClusterId, CredentialRef, Endpoint, InstanceId};
use corral_common::{CorralError, CorralResult};
use corral_topology::gtid::{AppliedSet, HistoryRelation};
use corral_topology::model::{Cluster, Instance, InstanceRole, InstanceState, TopologyMode};

use crate::probe::{ChannelHealth, InstanceProbe, ProbeReading};
use crate::session::{AdminCommand, CommandOutput, ConnectionProvider, Session};

const ADMIN_CREDENTIAL: &str = "sim-admin";

#[derive(Debug, Clone)]
struct SimChannel {
    name: String,
    source: Endpoint,
    credential: String,
    running: bool,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct SimNode {
    uuid: String,
    reachable: bool,
    state: InstanceState,
    role: InstanceRole,
    applied: AppliedSet,
    read_only: bool,
    /// Current group view (includes self) or None when standalone.
    group: Option<BTreeSet<Endpoint>>,
    view_id: u64,
    auto_start: bool,
    channel: Option<SimChannel>,
    /// Ticks of recovery left before a joining node turns ONLINE.
    recovery_remaining: u32,
    /// Next sequence number this node assigns to its own writes.
    write_seq: u64,
}

impl SimNode {
    fn new(uuid: String) -> Self {
        Self {
            uuid,
            reachable: true,
            state: InstanceState::Offline,
            role: InstanceRole::Secondary,
            applied: AppliedSet::new(),
            read_only: true,
            group: None,
            view_id: 0,
            auto_start: true,
            channel: None,
            recovery_remaining: 0,
            write_seq: 0,
        }
    }

    fn is_live(&self) -> bool {
        self.reachable && self.state == InstanceState::Online
    }
}

struct FleetState {
    nodes: BTreeMap<Endpoint, SimNode>,
    credentials: BTreeSet<String>,
    next_uuid: u64,
    fail_next_seed: bool,
    recovery_ticks: u32,
}

/// The simulated fleet. Cloning the handle shares the underlying state.
#[derive(Clone)]
pub struct SimFleet {
    state: Arc<Mutex<FleetState>>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::with_recovery_ticks(2)
    }

    /// `recovery_ticks` controls how many probe ticks a joining node
    /// spends in RECOVERING before turning ONLINE.
    pub fn with_recovery_ticks(recovery_ticks: u32) -> Self {
        let mut credentials = BTreeSet::new();
        credentials.insert(ADMIN_CREDENTIAL.to_string());
        Self {
            state: Arc::new(Mutex::new(FleetState {
                nodes: BTreeMap::new(),
                credentials,
                next_uuid: 1,
                fail_next_seed: false,
                recovery_ticks,
            })),
        }
    }

    /// The always-valid administrative credential.
    pub fn admin_credential(&self) -> CredentialRef {
        CredentialRef(ADMIN_CREDENTIAL.to_string())
    }

    /// Register a fresh, reachable, standalone node.
    pub fn add_node(&self, host: &str, port: u16) -> Endpoint {
        let endpoint = Endpoint::new(host, port);
        let mut st = self.state.lock();
        let uuid = format!("uuid-{}", st.next_uuid);
        st.next_uuid += 1;
        st.nodes.insert(endpoint.clone(), SimNode::new(uuid));
        endpoint
    }

    pub fn set_reachable(&self, endpoint: &Endpoint, reachable: bool) {
        let mut st = self.state.lock();
        if let Some(node) = st.nodes.get_mut(endpoint) {
            node.reachable = reachable;
        }
    }

    /// Push a node to OFFLINE (group dissolution on that member), keeping
    /// it reachable unless told otherwise.
    pub fn force_offline(&self, endpoint: &Endpoint) {
        let mut st = self.state.lock();
        if let Some(node) = st.nodes.get_mut(endpoint) {
            node.state = InstanceState::Offline;
            node.role = InstanceRole::Secondary;
            node.read_only = true;
        }
    }

    /// Mint a replication credential known to every node.
    pub fn mint_credential(&self, name: &str) -> CredentialRef {
        self.state.lock().credentials.insert(name.to_string());
        CredentialRef(name.to_string())
    }

    /// Make the next `SeedFrom` command fail, for rollback tests.
    pub fn fail_next_seed(&self) {
        self.state.lock().fail_next_seed = true;
    }

    /// Append `n` transactions at `endpoint` (must be a live primary).
    pub fn write(&self, endpoint: &Endpoint, n: u64) {
        let mut st = self.state.lock();
        let node = st.nodes.get_mut(endpoint).expect("unknown node");
        assert_eq!(node.role, InstanceRole::Primary, "writes go to the primary");
        let lo = node.write_seq + 1;
        let hi = node.write_seq + n;
        node.write_seq = hi;
        let uuid = node.uuid.clone();
        node.applied.add_range(&uuid, lo, hi);
    }

    /// Apply `n` local transactions regardless of role; used to inject
    /// divergent history.
    pub fn inject_local_transactions(&self, endpoint: &Endpoint, n: u64) {
        let mut st = self.state.lock();
        let node = st.nodes.get_mut(endpoint).expect("unknown node");
        let lo = node.write_seq + 1;
        let hi = node.write_seq + n;
        node.write_seq = hi;
        let uuid = node.uuid.clone();
        node.applied.add_range(&uuid, lo, hi);
    }

    /// Test shortcut: bootstrap a single-member group on `endpoint`.
    pub fn bootstrap_group(&self, endpoint: &Endpoint) {
        let mut st = self.state.lock();
        Self::command_on(&mut st, endpoint, AdminCommand::BootstrapGroup)
            .expect("bootstrap_group on sim node");
    }

    /// Test shortcut: join `endpoint` to the group of `seed` using a
    /// scratch credential, then settle.
    pub fn join_group(&self, endpoint: &Endpoint, seed: &Endpoint) {
        let cred = self.mint_credential("sim-join");
        {
            let mut st = self.state.lock();
            Self::command_on(
                &mut st,
                endpoint,
                AdminCommand::JoinGroup {
                    seed: seed.clone(),
                    credential: cred,
                    method: Default::default(),
                },
            )
            .expect("join_group on sim node");
        }
        self.settle();
    }

    /// Run enough ticks for recovery, catch-up and elections to finish.
    pub fn settle(&self) {
        let rounds = {
            let st = self.state.lock();
            st.recovery_ticks as usize + 8
        };
        for _ in 0..rounds {
            Self::tick(&mut self.state.lock());
        }
    }

    // ── God-view accessors for assertions ───────────────────────────────

    pub fn node_role(&self, endpoint: &Endpoint) -> Option<InstanceRole> {
        self.state.lock().nodes.get(endpoint).map(|n| n.role)
    }

    pub fn node_state(&self, endpoint: &Endpoint) -> Option<InstanceState> {
        self.state.lock().nodes.get(endpoint).map(|n| n.state)
    }

    pub fn applied_of(&self, endpoint: &Endpoint) -> AppliedSet {
        self.state
            .lock()
            .nodes
            .get(endpoint)
            .map(|n| n.applied.clone())
            .unwrap_or_default()
    }

    pub fn channel_source(&self, endpoint: &Endpoint) -> Option<Endpoint> {
        self.state
            .lock()
            .nodes
            .get(endpoint)
            .and_then(|n| n.channel.as_ref())
            .map(|c| c.source.clone())
    }

    pub fn channel_running(&self, endpoint: &Endpoint) -> bool {
        self.state
            .lock()
            .nodes
            .get(endpoint)
            .and_then(|n| n.channel.as_ref())
            .is_some_and(|c| c.running)
    }

    /// Build a `Cluster` model reflecting the fleet's current state, for
    /// evaluator-level tests that bypass the orchestrator.
    pub fn cluster_model(&self, name: &str, members: &[Endpoint]) -> Cluster {
        let st = self.state.lock();
        let mut cluster = Cluster::new(ClusterId(1), name, TopologyMode::SinglePrimary);
        for endpoint in members {
            let node = st.nodes.get(endpoint).expect("unknown node");
            cluster.members.push(Instance {
                id: InstanceId(node.uuid.clone()),
                endpoint: endpoint.clone(),
                role: node.role,
                state: node.state,
                applied_set: node.applied.clone(),
                read_only: node.read_only,
                recovery_account: None,
            });
        }
        cluster
    }

    // ── Simulation mechanics ────────────────────────────────────────────

    /// Advance the world one step: recovery progress, replication
    /// catch-up, channel apply, and primary election.
    fn tick(st: &mut FleetState) {
        // Recovery progress.
        for node in st.nodes.values_mut() {
            if node.state == InstanceState::Recovering && node.reachable {
                if node.recovery_remaining > 0 {
                    node.recovery_remaining -= 1;
                } else {
                    node.state = InstanceState::Online;
                }
            }
        }

        // Channel apply: subscriber pulls the source's applied set.
        let endpoints: Vec<Endpoint> = st.nodes.keys().cloned().collect();
        for endpoint in &endpoints {
            let Some(channel) = st.nodes[endpoint].channel.clone() else {
                continue;
            };
            if !channel.running || !st.nodes[endpoint].is_live() {
                continue;
            }
            let Some(source) = st.nodes.get(&channel.source) else {
                continue;
            };
            if !source.reachable {
                continue;
            }
            let incoming = source.applied.clone();
            if let Some(node) = st.nodes.get_mut(endpoint) {
                node.applied.union_with(&incoming);
            }
        }

        // In-group catch-up and election, one group at a time.
        let mut processed: BTreeSet<Endpoint> = BTreeSet::new();
        for endpoint in &endpoints {
            if processed.contains(endpoint) {
                continue;
            }
            let Some(group) = st.nodes[endpoint].group.clone() else {
                continue;
            };
            processed.extend(group.iter().cloned());

            let live_primary = group.iter().find(|ep| {
                st.nodes
                    .get(*ep)
                    .is_some_and(|n| n.role == InstanceRole::Primary && n.is_live())
            });

            if let Some(primary_ep) = live_primary {
                let primary_set = st.nodes[primary_ep].applied.clone();
                for ep in &group {
                    if ep == primary_ep {
                        continue;
                    }
                    if let Some(node) = st.nodes.get_mut(ep) {
                        if node.is_live() {
                            node.applied.union_with(&primary_set);
                        }
                    }
                }
            } else {
                Self::elect(st, &group);
            }
        }
    }

    /// Elect the most-advanced live member of `group` as primary, if the
    /// live members still form a majority of the group view.
    fn elect(st: &mut FleetState, group: &BTreeSet<Endpoint>) {
        let live: Vec<&Endpoint> = group
            .iter()
            .filter(|ep| st.nodes.get(*ep).is_some_and(SimNode::is_live))
            .collect();
        if live.is_empty() || live.len() < group.len() / 2 + 1 {
            return;
        }
        let winner = live
            .iter()
            .max_by(|a, b| {
                let ca = st.nodes[*a].applied.count();
                let cb = st.nodes[*b].applied.count();
                ca.cmp(&cb).then_with(|| b.cmp(a))
            })
            .copied()
            .cloned();
        if let Some(winner) = winner {
            for ep in group {
                if let Some(node) = st.nodes.get_mut(ep) {
                    if *ep == winner {
                        node.role = InstanceRole::Primary;
                        node.read_only = false;
                    } else if node.role == InstanceRole::Primary {
                        node.role = InstanceRole::Secondary;
                        node.read_only = true;
                    }
                }
            }
            tracing::debug!(primary = %winner, "sim: group elected new primary");
        }
    }

    /// Execute an administrative command against one node.
    fn command_on(
        st: &mut FleetState,
        endpoint: &Endpoint,
        command: AdminCommand,
    ) -> CorralResult<CommandOutput> {
        let exists_reachable = st.nodes.get(endpoint).map(|n| n.reachable);
        match exists_reachable {
            None => {
                return Err(CorralError::Connect {
                    endpoint: endpoint.clone(),
                    reason: "no such host".into(),
                })
            }
            Some(false) => {
                return Err(CorralError::Connect {
                    endpoint: endpoint.clone(),
                    reason: "connection timed out".into(),
                })
            }
            Some(true) => {}
        }

        let remote = |reason: &str| CorralError::Remote {
            endpoint: endpoint.clone(),
            command: command.name().to_string(),
            reason: reason.to_string(),
        };

        match &command {
            AdminCommand::BootstrapGroup => {
                let node = st.nodes.get_mut(endpoint).expect("checked above");
                let mut group = BTreeSet::new();
                group.insert(endpoint.clone());
                node.group = Some(group);
                node.role = InstanceRole::Primary;
                node.state = InstanceState::Online;
                node.read_only = false;
                node.recovery_remaining = 0;
                node.view_id += 1;
            }
            AdminCommand::JoinGroup {
                seed, credential, ..
            } => {
                if !st.credentials.contains(&credential.0) {
                    return Err(remote("recovery credential rejected"));
                }
                let (seed_group, seed_applied) = match st.nodes.get(seed) {
                    Some(s) if s.reachable => match &s.group {
                        Some(g) => (g.clone(), s.applied.clone()),
                        None => return Err(remote("seed is not part of a group")),
                    },
                    _ => return Err(remote("seed unreachable")),
                };
                {
                    let node = st.nodes.get_mut(endpoint).expect("checked above");
                    if node.applied.relation(&seed_applied) == HistoryRelation::Diverged {
                        return Err(remote("local history conflicts with group"));
                    }
                    let mut new_group = seed_group.clone();
                    new_group.insert(endpoint.clone());
                    node.group = Some(new_group);
                    node.role = InstanceRole::Secondary;
                    node.read_only = true;
                    node.state = InstanceState::Recovering;
                    node.recovery_remaining = st.recovery_ticks;
                    node.view_id += 1;
                }
                for ep in seed_group {
                    if let Some(peer) = st.nodes.get_mut(&ep) {
                        if let Some(g) = &mut peer.group {
                            g.insert(endpoint.clone());
                        }
                        peer.view_id += 1;
                    }
                }
            }
            AdminCommand::LeaveGroup => {
                let group = st.nodes.get(endpoint).and_then(|n| n.group.clone());
                if let Some(group) = group {
                    for ep in &group {
                        if let Some(peer) = st.nodes.get_mut(ep) {
                            if let Some(g) = &mut peer.group {
                                g.remove(endpoint);
                            }
                            peer.view_id += 1;
                        }
                    }
                }
                let node = st.nodes.get_mut(endpoint).expect("checked above");
                node.group = None;
                node.role = InstanceRole::Secondary;
                node.read_only = true;
                node.state = InstanceState::Offline;
            }
            AdminCommand::ForceMembership { survivors } => {
                if survivors.is_empty() {
                    return Err(remote("empty survivor list"));
                }
                let set: BTreeSet<Endpoint> = survivors.iter().cloned().collect();
                for ep in &set {
                    if let Some(node) = st.nodes.get_mut(ep) {
                        node.group = Some(set.clone());
                        node.state = InstanceState::Online;
                        node.role = InstanceRole::Secondary;
                        node.read_only = true;
                        node.view_id += 1;
                    }
                }
                Self::elect(st, &set);
            }
            AdminCommand::ElectPrimary { candidate } => {
                let group = match &st.nodes[endpoint].group {
                    Some(g) => g.clone(),
                    None => return Err(remote("not part of a group")),
                };
                if st.nodes[endpoint].role != InstanceRole::Primary {
                    return Err(remote("election must run on the current primary"));
                }
                let target = group
                    .iter()
                    .find(|ep| st.nodes.get(*ep).is_some_and(|n| n.uuid == candidate.0))
                    .cloned()
                    .ok_or_else(|| remote("candidate not in group"))?;
                if !st.nodes[&target].is_live() {
                    return Err(remote("candidate not ONLINE"));
                }
                for ep in &group {
                    if let Some(node) = st.nodes.get_mut(ep) {
                        if *ep == target {
                            node.role = InstanceRole::Primary;
                            node.read_only = false;
                        } else if node.role == InstanceRole::Primary {
                            node.role = InstanceRole::Secondary;
                            node.read_only = true;
                        }
                    }
                }
            }
            AdminCommand::CreateRecoveryAccount { account } => {
                st.credentials.insert(account.clone());
                return Ok(CommandOutput::Credential(CredentialRef(account.clone())));
            }
            AdminCommand::DropRecoveryAccount { account } => {
                st.credentials.remove(account);
            }
            AdminCommand::SetAutoStart { enabled } => {
                let node = st.nodes.get_mut(endpoint).expect("checked above");
                node.auto_start = *enabled;
            }
            AdminCommand::ClearClusterSetSettings => {
                let node = st.nodes.get_mut(endpoint).expect("checked above");
                node.channel = None;
            }
            AdminCommand::SeedFrom { source, .. } => {
                if st.fail_next_seed {
                    st.fail_next_seed = false;
                    return Err(remote("seed transfer failed"));
                }
                let source_applied = match st.nodes.get(source) {
                    Some(s) if s.reachable => s.applied.clone(),
                    _ => return Err(remote("seed source unreachable")),
                };
                let node = st.nodes.get_mut(endpoint).expect("checked above");
                if node.applied.relation(&source_applied) == HistoryRelation::Diverged {
                    return Err(remote("target has conflicting local history"));
                }
                node.applied.union_with(&source_applied);
            }
            AdminCommand::ConfigureChannel {
                name,
                source,
                credential,
                ..
            } => {
                if !st.credentials.contains(&credential.0) {
                    return Err(remote("channel credential rejected"));
                }
                let node = st.nodes.get_mut(endpoint).expect("checked above");
                node.channel = Some(SimChannel {
                    name: name.0.clone(),
                    source: source.clone(),
                    credential: credential.0.clone(),
                    running: false,
                    error: None,
                });
            }
            AdminCommand::StartChannel { name } => {
                let node = st.nodes.get_mut(endpoint).expect("checked above");
                match &mut node.channel {
                    Some(ch) if ch.name == name.0 => ch.running = true,
                    _ => return Err(remote("channel not configured")),
                }
            }
            AdminCommand::StopChannel { name } => {
                let node = st.nodes.get_mut(endpoint).expect("checked above");
                if let Some(ch) = &mut node.channel {
                    if ch.name == name.0 {
                        ch.running = false;
                    }
                }
            }
            AdminCommand::ResetChannel { name } => {
                let node = st.nodes.get_mut(endpoint).expect("checked above");
                if node.channel.as_ref().is_some_and(|ch| ch.name == name.0) {
                    node.channel = None;
                }
            }
        }
        Ok(CommandOutput::Done)
    }
}

impl Default for SimFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceProbe for SimFleet {
    fn read_state(&self, endpoint: &Endpoint) -> CorralResult<ProbeReading> {
        let mut st = self.state.lock();
        Self::tick(&mut st);

        let node = st.nodes.get(endpoint).ok_or_else(|| CorralError::Connect {
            endpoint: endpoint.clone(),
            reason: "no such host".into(),
        })?;
        if !node.reachable {
            return Err(CorralError::Connect {
                endpoint: endpoint.clone(),
                reason: "connection timed out".into(),
            });
        }

        let peers_online = node
            .group
            .as_ref()
            .map(|group| {
                group
                    .iter()
                    .filter(|ep| st.nodes.get(*ep).is_some_and(SimNode::is_live))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut variables = BTreeMap::new();
        variables.insert(
            "group_auto_start".to_string(),
            (if node.auto_start { "ON" } else { "OFF" }).to_string(),
        );

        let mut channels = BTreeMap::new();
        if let Some(ch) = &node.channel {
            let source_reachable = st.nodes.get(&ch.source).is_some_and(|s| s.reachable);
            channels.insert(
                ch.name.clone(),
                ChannelHealth {
                    source: ch.source.clone(),
                    applying: ch.running && source_reachable && ch.error.is_none(),
                    last_error: ch.error.clone(),
                },
            );
        }

        Ok(ProbeReading {
            instance_id: InstanceId(node.uuid.clone()),
            role: node.role,
            state: node.state,
            applied_set: node.applied.clone(),
            read_only: node.read_only,
            view_id: node.view_id,
            peers_online,
            variables,
            channels,
        })
    }
}

struct SimSession {
    state: Arc<Mutex<FleetState>>,
    endpoint: Endpoint,
}

impl Session for SimSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn execute(&mut self, command: AdminCommand) -> CorralResult<CommandOutput> {
        let mut st = self.state.lock();
        let output = SimFleet::command_on(&mut st, &self.endpoint, command)?;
        SimFleet::tick(&mut st);
        Ok(output)
    }
}

impl ConnectionProvider for SimFleet {
    fn open(
        &self,
        endpoint: &Endpoint,
        credential: &CredentialRef,
    ) -> CorralResult<Box<dyn Session>> {
        let st = self.state.lock();
        match st.nodes.get(endpoint) {
            None => Err(CorralError::Connect {
                endpoint: endpoint.clone(),
                reason: "no such host".into(),
            }),
            Some(node) if !node.reachable => Err(CorralError::Connect {
                endpoint: endpoint.clone(),
                reason: "connection timed out".into(),
            }),
            Some(_) => {
                if !st.credentials.contains(&credential.0) {
                    return Err(CorralError::Connect {
                        endpoint: endpoint.clone(),
                        reason: "authentication failed".into(),
                    });
                }
                Ok(Box::new(SimSession {
                    state: self.state.clone(),
                    endpoint: endpoint.clone(),
                }))
            }
        }
    }
}
