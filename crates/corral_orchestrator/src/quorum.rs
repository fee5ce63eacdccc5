//! Quorum and consistency evaluation.
//!
//! Quorum is mutual group agreement, not mere reachability: a member
//! counts only if it is ONLINE *and* its own view of the group contains a
//! strict majority of the configured members. Consistency comparisons are
//! pure functions over applied-transaction-set snapshots; `wait_for_sync`
//! is a snapshot-based catch-up wait — the target must cover the source's
//! set *as of the call*, not chase a moving head.

use std::time::{Duration, Instant};

use corral_common::types::Endpoint;
use corral_common::{CancelToken, CorralError, CorralResult};
use corral_topology::gtid::{AppliedSet, HistoryRelation};
use corral_topology::model::Cluster;

use crate::probe::InstanceProbe;

/// Result of comparing two nodes' transaction histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// One history is a prefix of (or equal to) the other.
    Consistent,
    /// Neither is a prefix of the other; automated merging is blocked.
    Diverged,
    /// One side is unreachable.
    Unknown,
}

/// Evaluates quorum and history consistency from live probe readings.
pub struct QuorumEvaluator<'a> {
    probe: &'a dyn InstanceProbe,
}

impl<'a> QuorumEvaluator<'a> {
    pub fn new(probe: &'a dyn InstanceProbe) -> Self {
        Self { probe }
    }

    /// True iff a strict majority of the cluster's configured members
    /// report ONLINE membership from each other's perspective.
    pub fn has_quorum(&self, cluster: &Cluster) -> bool {
        let configured = cluster.members.len();
        if configured == 0 {
            return false;
        }
        let majority = configured / 2 + 1;

        let mut agreeing = 0usize;
        for member in &cluster.members {
            let Ok(reading) = self.probe.read_state(&member.endpoint) else {
                continue;
            };
            if !reading.is_online() {
                continue;
            }
            // The member's own view (peers + itself) must cover a majority
            // of the configured membership.
            let mut seen = 1usize; // itself
            for peer in &reading.peers_online {
                if peer != &member.endpoint && cluster.has_member(peer) {
                    seen += 1;
                }
            }
            if seen >= majority {
                agreeing += 1;
            }
        }
        agreeing >= majority
    }

    /// Validate a `force_quorum` survivor list without mutating anything.
    ///
    /// Survivors must be non-empty, all configured members, all
    /// reachable, and pairwise non-diverged — a survivor set that cannot
    /// agree on history must not be installed. Returns each survivor's
    /// applied set for the caller's election choice.
    pub fn validate_force_quorum(
        &self,
        cluster: &Cluster,
        survivors: &[Endpoint],
    ) -> CorralResult<Vec<(Endpoint, AppliedSet)>> {
        if survivors.is_empty() {
            return Err(CorralError::PreconditionFailed(
                "force_quorum requires at least one survivor".into(),
            ));
        }
        if self.has_quorum(cluster) {
            return Err(CorralError::PreconditionFailed(format!(
                "cluster '{}' still has quorum; force_quorum is only usable after quorum loss",
                cluster.name
            )));
        }

        let mut readings = Vec::with_capacity(survivors.len());
        for endpoint in survivors {
            if !cluster.has_member(endpoint) {
                return Err(CorralError::PreconditionFailed(format!(
                    "survivor {endpoint} is not a member of cluster '{}'",
                    cluster.name
                )));
            }
            let reading = self.probe.read_state(endpoint)?;
            readings.push((endpoint.clone(), reading.applied_set));
        }

        for i in 0..readings.len() {
            for j in (i + 1)..readings.len() {
                let (a_ep, a) = &readings[i];
                let (b_ep, b) = &readings[j];
                if a.relation(b) == HistoryRelation::Diverged {
                    tracing::error!(
                        a = %a_ep, b = %b_ep,
                        "force_quorum survivors have diverged histories"
                    );
                    return Err(CorralError::Diverged {
                        a: a.to_string(),
                        b: b.to_string(),
                    });
                }
            }
        }
        Ok(readings)
    }

    /// Compare two nodes' histories. `Unknown` when either side cannot be
    /// probed.
    pub fn is_consistent(&self, a: &Endpoint, b: &Endpoint) -> Consistency {
        let (Ok(ra), Ok(rb)) = (self.probe.read_state(a), self.probe.read_state(b)) else {
            return Consistency::Unknown;
        };
        match ra.applied_set.relation(&rb.applied_set) {
            HistoryRelation::Diverged => Consistency::Diverged,
            _ => Consistency::Consistent,
        }
    }

    /// Wait until `target` has applied everything `source` had applied at
    /// the moment of this call. Used before removing or repointing an
    /// instance so no committed transaction is lost.
    ///
    /// Diverged histories fail immediately; they will never converge.
    pub fn wait_for_sync(
        &self,
        source: &Endpoint,
        target: &Endpoint,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancelToken,
    ) -> CorralResult<()> {
        // Snapshot the goal once; this is a catch-up wait, not a race
        // against new writes.
        let goal = self.probe.read_state(source)?.applied_set;
        let start = Instant::now();
        let deadline = start + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(CorralError::Cancelled(
                    cancel.reason().unwrap_or_else(|| "wait_for_sync".into()),
                ));
            }
            match self.probe.read_state(target) {
                Ok(reading) => {
                    if goal.is_subset_of(&reading.applied_set) {
                        tracing::debug!(
                            source = %source, target = %target,
                            waited_ms = start.elapsed().as_millis() as u64,
                            "target caught up to source snapshot"
                        );
                        return Ok(());
                    }
                    if reading.applied_set.relation(&goal) == HistoryRelation::Diverged {
                        return Err(CorralError::Diverged {
                            a: goal.to_string(),
                            b: reading.applied_set.to_string(),
                        });
                    }
                }
                Err(CorralError::Connect { .. }) => {
                    // Transient; keep polling until the deadline.
                }
                Err(other) => return Err(other),
            }

            if Instant::now() >= deadline {
                return Err(CorralError::SyncTimeout {
                    endpoint: target.clone(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            if cancel.wait_timeout(poll_interval) {
                return Err(CorralError::Cancelled(
                    cancel.reason().unwrap_or_else(|| "wait_for_sync".into()),
                ));
            }
        }
    }
}
