//! Topology orchestrator for group-replicated database clusters and
//! cluster sets.
//!
//! # Architecture
//!
//! ```text
//!   Orchestrator (one call per operation, explicit parameters)
//!       |
//!       +-- MetadataTxn ......... read-validate-write against the store
//!       +-- InstanceProbe ....... live role/state/applied-set readings
//!       +-- QuorumEvaluator ..... majority agreement + history comparison
//!       +-- Session/Provider .... administrative commands on remote nodes
//!       +-- ChannelConfigurator . establish/repoint cluster-set channels
//!       +-- Convergence ......... bounded poll until intent == observed
//!       +-- TopologyEventLog .... structured phase-transition record
//! ```
//!
//! Every operation follows the same template: **load** metadata and probe
//! affected instances, **validate** preconditions, **execute** remote
//! mutations in documented order, **converge** by polling the probe with
//! a bounded interval, **commit** metadata under an optimistic version
//! check, and **report** an [`Outcome`] whose warnings are separate from
//! hard failures. A failure names the phase it happened in.

pub mod channel;
pub mod convergence;
pub mod event_log;
pub mod orchestrator;
pub mod outcome;
pub mod probe;
pub mod quorum;
pub mod report;
pub mod session;
pub mod sim;

mod cluster_set_ops;

pub use channel::ChannelConfigurator;
pub use convergence::Convergence;
pub use event_log::{TopologyEvent, TopologyEventLog};
pub use orchestrator::Orchestrator;
pub use outcome::{OpError, OpOptions, OpResult, Outcome, Warning};
pub use probe::{ChannelHealth, InstanceProbe, ProbeReading};
pub use quorum::{Consistency, QuorumEvaluator};
pub use report::{ClusterSetStatus, ClusterStatus, DriftReport, InstanceStatus};
pub use session::{AdminCommand, CommandOutput, ConnectionProvider, RecoveryMethod, Session};
pub use sim::SimFleet;
