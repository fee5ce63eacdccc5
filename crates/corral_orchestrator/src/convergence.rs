//! Bounded convergence polling.
//!
//! An operation's mutations are asynchronous on the remote side: a join
//! recovers, an election settles, a channel starts applying. The
//! orchestrator polls the probe until the observed state matches intent,
//! separated by a fixed interval — never a tight loop — and bounded by a
//! deadline. The interval sleep goes through the [`CancelToken`] so a
//! cancelled operation wakes immediately.
//!
//! `Connect` failures during a wait are tolerated: a node mid-restart is
//! expected to drop probes for a while. Any other probe error aborts the
//! wait.

use std::time::{Duration, Instant};

use corral_common::types::Endpoint;
use corral_common::{CancelToken, CorralError, CorralResult};

use crate::probe::{InstanceProbe, ProbeReading};

/// A convergence polling context: probe handle plus cadence and deadline.
pub struct Convergence<'a> {
    probe: &'a dyn InstanceProbe,
    interval: Duration,
    timeout: Duration,
    cancel: &'a CancelToken,
}

impl<'a> Convergence<'a> {
    pub fn new(
        probe: &'a dyn InstanceProbe,
        interval: Duration,
        timeout: Duration,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            probe,
            interval,
            timeout,
            cancel,
        }
    }

    /// Poll `endpoint` until `pred` accepts a reading. Returns the
    /// accepting reading, or `SyncTimeout` / `Cancelled`.
    ///
    /// `what` names the awaited condition for logs and errors.
    pub fn wait_until<F>(
        &self,
        endpoint: &Endpoint,
        what: &str,
        pred: F,
    ) -> CorralResult<ProbeReading>
    where
        F: Fn(&ProbeReading) -> bool,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut last_state = String::from("never probed");

        loop {
            if self.cancel.is_cancelled() {
                return Err(CorralError::Cancelled(
                    self.cancel.reason().unwrap_or_else(|| what.to_string()),
                ));
            }

            match self.probe.read_state(endpoint) {
                Ok(reading) => {
                    if pred(&reading) {
                        tracing::debug!(
                            endpoint = %endpoint,
                            waited_ms = start.elapsed().as_millis() as u64,
                            "converged: {what}"
                        );
                        return Ok(reading);
                    }
                    last_state = format!("{}/{}", reading.role, reading.state);
                }
                Err(CorralError::Connect { .. }) => {
                    // Node restarting or still joining; keep polling.
                    last_state = String::from("unreachable");
                }
                Err(other) => return Err(other),
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    endpoint = %endpoint,
                    last_state = %last_state,
                    "convergence wait '{what}' timed out"
                );
                return Err(CorralError::SyncTimeout {
                    endpoint: endpoint.clone(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            if self.cancel.wait_timeout(self.interval) {
                return Err(CorralError::Cancelled(
                    self.cancel.reason().unwrap_or_else(|| what.to_string()),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFleet;
    use corral_topology::model::InstanceState;

    #[test]
    fn wait_until_times_out_with_elapsed() {
        let fleet = SimFleet::new();
        let ep = fleet.add_node("a", 3306);
        let cancel = CancelToken::new();
        let conv = Convergence::new(
            &fleet,
            Duration::from_millis(1),
            Duration::from_millis(20),
            &cancel,
        );

        // The node never comes online by itself.
        let err = conv
            .wait_until(&ep, "state ONLINE", |r| r.state == InstanceState::Online)
            .unwrap_err();
        match err {
            CorralError::SyncTimeout { waited_ms, .. } => assert!(waited_ms >= 20),
            other => panic!("expected SyncTimeout, got {other}"),
        }
    }

    #[test]
    fn cancellation_aborts_wait() {
        let fleet = SimFleet::new();
        let ep = fleet.add_node("a", 3306);
        let cancel = CancelToken::new();
        cancel.cancel("test abort");
        let conv = Convergence::new(
            &fleet,
            Duration::from_millis(1),
            Duration::from_secs(5),
            &cancel,
        );

        let err = conv
            .wait_until(&ep, "anything", |_| false)
            .unwrap_err();
        assert!(matches!(err, CorralError::Cancelled(_)));
    }

    #[test]
    fn unreachable_node_is_polled_not_fatal() {
        let fleet = SimFleet::new();
        let ep = fleet.add_node("a", 3306);
        fleet.set_reachable(&ep, false);
        let cancel = CancelToken::new();
        let conv = Convergence::new(
            &fleet,
            Duration::from_millis(1),
            Duration::from_millis(15),
            &cancel,
        );

        // Connect failures poll through to the deadline rather than abort.
        let err = conv.wait_until(&ep, "online", |r| r.is_online()).unwrap_err();
        assert!(matches!(err, CorralError::SyncTimeout { .. }));
    }
}
