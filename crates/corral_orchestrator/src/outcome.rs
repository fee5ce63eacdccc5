//! Operation outcomes, options, and phase-tagged failures.
//!
//! An operation either succeeds with an [`Outcome`] — its payload plus
//! any non-fatal warnings — or fails with an [`OpError`] naming the phase
//! of the template (validate / execute / converge / commit) it failed in.
//! Warnings never ride on the error path: an operation that needed
//! residual follow-up still *succeeded*.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use corral_common::{CorralError, ErrorKind, OpPhase};

use crate::session::RecoveryMethod;

/// A non-fatal observation surfaced to the caller alongside success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning(pub String);

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Successful result of an operation.
#[derive(Debug, Clone)]
pub struct Outcome<T = ()> {
    pub value: T,
    pub warnings: Vec<Warning>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<Warning>) -> Self {
        Self { value, warnings }
    }

    pub fn push_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(Warning(message.into()));
    }
}

/// An operation failure, tagged with the template phase it occurred in.
#[derive(Debug, Error)]
#[error("{phase} phase failed: {source}")]
pub struct OpError {
    pub phase: OpPhase,
    pub source: CorralError,
}

impl OpError {
    pub fn new(phase: OpPhase, source: CorralError) -> Self {
        Self { phase, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Result type of every orchestrator operation.
pub type OpResult<T> = Result<Outcome<T>, OpError>;

/// Extension to tag a raw error with the phase it occurred in.
pub(crate) trait PhaseExt<T> {
    fn in_phase(self, phase: OpPhase) -> Result<T, OpError>;
}

impl<T> PhaseExt<T> for Result<T, CorralError> {
    fn in_phase(self, phase: OpPhase) -> Result<T, OpError> {
        self.map_err(|source| OpError { phase, source })
    }
}

/// Recognized per-operation switches.
#[derive(Debug, Clone, Default)]
pub struct OpOptions {
    /// Bypass the quorum / newer-history gates. Never bypasses the
    /// diverged-history gate.
    pub force: bool,
    /// How a joining or seeded instance obtains its data.
    pub recovery_method: RecoveryMethod,
    /// Override the configured convergence deadline.
    pub timeout: Option<Duration>,
    /// Run load + validate only and report; mutate nothing.
    pub dry_run: bool,
}

impl OpOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_error_reports_phase_and_kind() {
        let err = OpError::new(
            OpPhase::Validate,
            CorralError::PreconditionFailed("no quorum".into()),
        );
        assert_eq!(err.kind(), ErrorKind::UserError);
        let msg = err.to_string();
        assert!(msg.contains("validate"), "message was: {msg}");
        assert!(msg.contains("no quorum"));
    }

    #[test]
    fn outcome_accumulates_warnings() {
        let mut out = Outcome::new(());
        out.push_warning("auto-start settings corrected");
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].to_string(), "auto-start settings corrected");
    }
}
