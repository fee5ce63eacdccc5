//! Error taxonomy for topology operations.
//!
//! Every failure an operation can produce is a named variant carrying the
//! context an operator needs to act on it. [`ErrorKind`] classifies each
//! variant for retry/escalation decisions:
//!
//! - `UserError`  — bad input or unsatisfied precondition; never retried
//!   automatically, requires caller action
//! - `Retryable`  — the caller should reload state and retry (e.g. a
//!   concurrent metadata writer won the version check)
//! - `Transient`  — network trouble or a deadline; retry after back-off,
//!   possibly with a longer timeout
//! - `Fatal`      — requires an explicit operator decision (diverged
//!   histories) or manual completion (partial failure); never auto-resolved

use thiserror::Error;

use crate::types::Endpoint;

/// Convenience alias for `Result<T, CorralError>`.
pub type CorralResult<T> = Result<T, CorralError>;

/// Error classification for retry/escalation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    Fatal,
}

/// The phase of the operation template in which a failure occurred.
///
/// Ordered: an operation that failed in `Converge` has already executed
/// its remote mutations; one that failed in `Validate` has mutated nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpPhase {
    Validate,
    Execute,
    Converge,
    Commit,
}

impl std::fmt::Display for OpPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpPhase::Validate => write!(f, "validate"),
            OpPhase::Execute => write!(f, "execute"),
            OpPhase::Converge => write!(f, "converge"),
            OpPhase::Commit => write!(f, "commit"),
        }
    }
}

/// Top-level error type for all orchestrator operations.
#[derive(Error, Debug)]
pub enum CorralError {
    /// Node unreachable at the transport level.
    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: Endpoint, reason: String },

    /// The node was reachable but an administrative command failed.
    #[error("remote command '{command}' failed on {endpoint}: {reason}")]
    Remote {
        endpoint: Endpoint,
        command: String,
        reason: String,
    },

    /// A precondition check failed; the operation mutated nothing.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A consistency catch-up wait exceeded its deadline.
    #[error("sync wait on {endpoint} exceeded deadline after {waited_ms}ms")]
    SyncTimeout { endpoint: Endpoint, waited_ms: u64 },

    /// Two transaction histories are mutually irreconcilable. Fatal:
    /// requires an explicit operator decision, never auto-resolved.
    #[error("transaction histories diverged: '{a}' vs '{b}'")]
    Diverged { a: String, b: String },

    /// The metadata version advanced underneath this operation.
    #[error("metadata version conflict: expected v{expected}, store is at v{actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// Some remote mutations completed before a later step failed.
    ///
    /// Lists exactly which steps completed so the operator can finish
    /// manually; the orchestrator does not guess at compensating actions
    /// it cannot safely perform (e.g. undoing a completed group join).
    #[error("partial failure at step '{failed_step}': {reason} (completed: {})", completed.join(", "))]
    PartialFailure {
        completed: Vec<String>,
        failed_step: String,
        reason: String,
    },

    /// The operation was cancelled before reaching its commit point.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Invariant violation or bug; should never occur in production.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CorralError {
    /// Classify this error for the caller's retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CorralError::Connect { .. } | CorralError::SyncTimeout { .. } => ErrorKind::Transient,
            CorralError::VersionConflict { .. } => ErrorKind::Retryable,
            CorralError::PreconditionFailed(_) | CorralError::Cancelled(_) => ErrorKind::UserError,
            CorralError::Diverged { .. }
            | CorralError::PartialFailure { .. }
            | CorralError::Remote { .. }
            | CorralError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// True when the caller may retry without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable | ErrorKind::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_retry_policy() {
        let e = CorralError::Connect {
            endpoint: Endpoint::new("h", 1),
            reason: "timed out".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_retryable());

        let e = CorralError::Diverged {
            a: "s1:1-5".into(),
            b: "s2:1-3".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Fatal);
        assert!(!e.is_retryable());

        let e = CorralError::VersionConflict {
            expected: 3,
            actual: 4,
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn partial_failure_names_completed_steps() {
        let e = CorralError::PartialFailure {
            completed: vec!["provision_credentials".into(), "join_group".into()],
            failed_step: "wait_online".into(),
            reason: "recovery stalled".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("provision_credentials"));
        assert!(msg.contains("wait_online"));
    }

    #[test]
    fn phases_are_ordered() {
        assert!(OpPhase::Validate < OpPhase::Execute);
        assert!(OpPhase::Converge < OpPhase::Commit);
    }
}
