//! Instance probe: reads a node's live state, never mutates.
//!
//! Probe readings drive both precondition checks and convergence polls.
//! A read failure is transient by default (network, timeout) and surfaces
//! as `Connect`; a node that is reachable but reports a fatal
//! configuration problem surfaces distinctly as `Remote`.

use std::collections::BTreeMap;

use corral_common::types::{Endpoint, InstanceId};
use corral_common::CorralResult;
use corral_topology::gtid::AppliedSet;
use corral_topology::model::{InstanceRole, InstanceState};

/// Live status of a named replication channel on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHealth {
    pub source: Endpoint,
    /// True when the applier thread is running with no error.
    pub applying: bool,
    pub last_error: Option<String>,
}

/// One observation of a node's live state.
#[derive(Debug, Clone)]
pub struct ProbeReading {
    /// The node's self-reported UUID.
    pub instance_id: InstanceId,
    pub role: InstanceRole,
    pub state: InstanceState,
    pub applied_set: AppliedSet,
    pub read_only: bool,
    /// Membership epoch of the node's current group view.
    pub view_id: u64,
    /// Members this node currently sees as ONLINE, from its own group
    /// view. Quorum requires mutual agreement, not mere reachability.
    pub peers_online: Vec<Endpoint>,
    /// Relevant persisted configuration variables (e.g. `group_auto_start`).
    pub variables: BTreeMap<String, String>,
    /// Channels configured on this node, by name.
    pub channels: BTreeMap<String, ChannelHealth>,
}

impl ProbeReading {
    pub fn is_online(&self) -> bool {
        self.state == InstanceState::Online
    }

    /// Persisted auto-start flag; absent means misconfigured.
    pub fn auto_start_enabled(&self) -> bool {
        self.variables
            .get("group_auto_start")
            .is_some_and(|v| v == "ON")
    }
}

/// Read-only view of a managed instance.
pub trait InstanceProbe: Send + Sync {
    /// Read the node's current state. Fails with `Connect` when the node
    /// is unreachable (transient) or `Remote` for a fatal configuration
    /// error the node itself reports.
    fn read_state(&self, endpoint: &Endpoint) -> CorralResult<ProbeReading>;
}
