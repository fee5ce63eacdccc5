//! Administrative command channel to managed instances.
//!
//! The orchestrator never speaks a wire protocol itself; it rides on
//! whatever command channel the [`ConnectionProvider`] exposes. Commands
//! are a closed enum so every remote mutation an operation can perform is
//! enumerable, loggable and mockable.

use std::fmt;

use corral_common::types::{ChannelName, CredentialRef, Endpoint, InstanceId};
use corral_common::CorralResult;

/// How a joining or seeded instance obtains its initial data set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMethod {
    /// Physical snapshot transfer; wipes the target.
    Clone,
    /// Replay missing transactions from the donor.
    Incremental,
    /// Let the engine pick based on donor/target applied sets.
    #[default]
    Auto,
}

impl fmt::Display for RecoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryMethod::Clone => write!(f, "clone"),
            RecoveryMethod::Incremental => write!(f, "incremental"),
            RecoveryMethod::Auto => write!(f, "auto"),
        }
    }
}

/// A remote administrative mutation. Executed on the session's endpoint;
/// fields name the *other* parties involved.
#[derive(Debug, Clone)]
pub enum AdminCommand {
    /// Initialize a fresh replication group on this node; it becomes the
    /// sole member and PRIMARY. Also used to re-bootstrap after a
    /// complete outage.
    BootstrapGroup,
    /// Join the group that `seed` belongs to, authenticating recovery
    /// with `credential`.
    JoinGroup {
        seed: Endpoint,
        credential: CredentialRef,
        method: RecoveryMethod,
    },
    /// Leave the current group cleanly.
    LeaveGroup,
    /// Narrow the expected membership to `survivors`. Only valid when
    /// quorum is lost; the engine re-forms the group from the survivors.
    ForceMembership { survivors: Vec<Endpoint> },
    /// Trigger primary election of `candidate` (executed on the current
    /// primary).
    ElectPrimary { candidate: InstanceId },
    /// Provision a recovery/replication account named `account`; returns
    /// a credential reference.
    CreateRecoveryAccount { account: String },
    /// Drop a previously provisioned account.
    DropRecoveryAccount { account: String },
    /// Persist (or correct) the group auto-start setting.
    SetAutoStart { enabled: bool },
    /// Strip all cluster-set replication settings from this node.
    ClearClusterSetSettings,
    /// Provision this node's data set from `source` before it forms or
    /// joins a cluster.
    SeedFrom {
        source: Endpoint,
        method: RecoveryMethod,
    },
    /// Write a named channel's source endpoint and credential. Does not
    /// start it.
    ConfigureChannel {
        name: ChannelName,
        source: Endpoint,
        credential: CredentialRef,
        connect_retry_secs: u32,
        applier_delay_secs: u32,
    },
    /// Start a configured channel.
    StartChannel { name: ChannelName },
    /// Stop a channel if running (no-op otherwise).
    StopChannel { name: ChannelName },
    /// Remove a channel's configuration entirely.
    ResetChannel { name: ChannelName },
}

impl AdminCommand {
    /// Stable short name for logs and partial-failure step lists.
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::BootstrapGroup => "bootstrap_group",
            AdminCommand::JoinGroup { .. } => "join_group",
            AdminCommand::LeaveGroup => "leave_group",
            AdminCommand::ForceMembership { .. } => "force_membership",
            AdminCommand::ElectPrimary { .. } => "elect_primary",
            AdminCommand::CreateRecoveryAccount { .. } => "create_recovery_account",
            AdminCommand::DropRecoveryAccount { .. } => "drop_recovery_account",
            AdminCommand::SetAutoStart { .. } => "set_auto_start",
            AdminCommand::ClearClusterSetSettings => "clear_cluster_set_settings",
            AdminCommand::SeedFrom { .. } => "seed_from",
            AdminCommand::ConfigureChannel { .. } => "configure_channel",
            AdminCommand::StartChannel { .. } => "start_channel",
            AdminCommand::StopChannel { .. } => "stop_channel",
            AdminCommand::ResetChannel { .. } => "reset_channel",
        }
    }
}

/// Result payload of an [`AdminCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    Done,
    /// Returned by `CreateRecoveryAccount`.
    Credential(CredentialRef),
}

/// A live administrative session to one instance.
pub trait Session {
    fn endpoint(&self) -> &Endpoint;

    /// Execute one command. Fails with `Connect` if the node dropped the
    /// session, or `Remote` if the node rejected the command.
    fn execute(&mut self, command: AdminCommand) -> CorralResult<CommandOutput>;
}

/// Yields sessions to managed instances. Sessions are scoped per remote
/// call sequence and released on drop.
pub trait ConnectionProvider: Send + Sync {
    /// Open a session authenticated by `credential`. Fails with `Connect`
    /// when the node is unreachable.
    fn open(&self, endpoint: &Endpoint, credential: &CredentialRef)
        -> CorralResult<Box<dyn Session>>;
}
