//! Shared foundation for the Corral topology orchestrator: typed
//! identifiers, the error taxonomy, configuration, and the cancellation
//! primitive used by convergence polls.

pub mod cancel;
pub mod config;
pub mod error;
pub mod types;

pub use cancel::CancelToken;
pub use config::{ChannelConfig, ConvergenceConfig, OrchestratorConfig, RecoveryConfig};
pub use error::{CorralError, CorralResult, ErrorKind, OpPhase};
pub use types::{ChannelName, ClusterId, ClusterSetId, CredentialRef, Endpoint, InstanceId};
