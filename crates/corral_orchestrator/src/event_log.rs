//! Structured topology event log.
//!
//! Every operation records its phase transitions here as well as through
//! `tracing`, so an operator can reconstruct what a long-running mutation
//! did (and where it stopped) without grepping process logs. Bounded ring
//! buffer; oldest entries fall off.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use corral_common::types::ClusterId;
use corral_common::OpPhase;

/// Severity of a topology event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSeverity::Info => write!(f, "info"),
            EventSeverity::Warn => write!(f, "warn"),
            EventSeverity::Error => write!(f, "error"),
        }
    }
}

/// A single topology event.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyEvent {
    /// Monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (ms since epoch).
    pub timestamp_ms: u64,
    /// Operation name, e.g. `add_instance`.
    pub operation: String,
    /// Template phase, when the event marks a phase transition.
    pub phase: Option<String>,
    pub severity: EventSeverity,
    /// Cluster the event pertains to, when known.
    pub cluster: Option<ClusterId>,
    pub message: String,
}

/// Bounded ring buffer of topology events.
pub struct TopologyEventLog {
    events: Mutex<VecDeque<TopologyEvent>>,
    max_events: usize,
    next_seq: Mutex<u64>,
}

impl TopologyEventLog {
    pub fn new(max_events: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::with_capacity(max_events)),
            max_events,
            next_seq: Mutex::new(1),
        })
    }

    /// Append an event.
    pub fn log(
        &self,
        operation: &str,
        phase: Option<OpPhase>,
        severity: EventSeverity,
        cluster: Option<ClusterId>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        let mut seq = self.next_seq.lock();
        let event = TopologyEvent {
            seq: *seq,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            operation: operation.to_string(),
            phase: phase.map(|p| p.to_string()),
            severity,
            cluster,
            message,
        };
        *seq += 1;

        tracing::info!(
            seq = event.seq,
            operation = %event.operation,
            phase = event.phase.as_deref().unwrap_or("-"),
            severity = %event.severity,
            "TOPOLOGY_EVENT: {}",
            event.message,
        );

        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Snapshot of all retained events, oldest first.
    pub fn snapshot(&self) -> Vec<TopologyEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Snapshot serialized as JSON, for operator tooling.
    pub fn snapshot_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest() {
        let log = TopologyEventLog::new(2);
        log.log("op_a", Some(OpPhase::Validate), EventSeverity::Info, None, "one");
        log.log("op_a", Some(OpPhase::Execute), EventSeverity::Info, None, "two");
        log.log("op_a", Some(OpPhase::Commit), EventSeverity::Info, None, "three");

        let events = log.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "two");
        assert_eq!(events[1].seq, 3);
    }

    #[test]
    fn json_snapshot_is_well_formed() {
        let log = TopologyEventLog::new(8);
        log.log(
            "set_primary_instance",
            Some(OpPhase::Converge),
            EventSeverity::Warn,
            Some(ClusterId(3)),
            "candidate lagging",
        );
        let json = log.snapshot_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["operation"], "set_primary_instance");
        assert_eq!(parsed[0]["phase"], "converge");
    }
}
