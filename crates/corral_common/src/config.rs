//! Orchestrator configuration.
//!
//! Poll cadence, deadlines and channel settings are operationally tuned
//! values, not architectural constants — they all live here and load from
//! `corral.toml`. Every section has serde defaults so a partial file (or
//! none at all) yields a working configuration.

use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Convergence polling: how long an operation waits for live state to
/// match intent, and how often it looks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Interval between probe polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall deadline for a convergence wait in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Deadline for `wait_for_sync` catch-up waits in milliseconds.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_sync_timeout_ms() -> u64 {
    120_000
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

/// Provisioning of new members joining a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Deadline for distributed recovery (clone or incremental catch-up)
    /// of a joining member, in milliseconds. Recovery can legitimately
    /// take minutes on a large data set.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Prefix for per-instance recovery account names.
    #[serde(default = "default_account_prefix")]
    pub account_prefix: String,
}

fn default_recovery_timeout_ms() -> u64 {
    600_000
}

fn default_account_prefix() -> String {
    "corral_recovery_".to_string()
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recovery_timeout_ms: default_recovery_timeout_ms(),
            account_prefix: default_account_prefix(),
        }
    }
}

/// Cross-cluster replication channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name used for cluster-set replication.
    #[serde(default = "default_channel_name")]
    pub name: String,
    /// Seconds between reconnect attempts on the subscriber side.
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u32,
    /// Optional intentional apply delay in seconds (0 = none).
    #[serde(default)]
    pub applier_delay_secs: u32,
}

fn default_channel_name() -> String {
    "clusterset_replication".to_string()
}

fn default_connect_retry_secs() -> u32 {
    3
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: default_channel_name(),
            connect_retry_secs: default_connect_retry_secs(),
            applier_delay_secs: 0,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a configuration from TOML text. Missing sections and fields
    /// fall back to defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.convergence.poll_interval_ms, 1_000);
        assert_eq!(cfg.channel.name, "clusterset_replication");
    }

    #[test]
    fn partial_section_overrides_only_named_fields() {
        let cfg = OrchestratorConfig::from_toml_str(
            r#"
            [convergence]
            poll_interval_ms = 250
            timeout_ms = 5000
            sync_timeout_ms = 10000

            [channel]
            name = "set_repl"
            connect_retry_secs = 5
            applier_delay_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.convergence.poll_interval_ms, 250);
        assert_eq!(cfg.channel.name, "set_repl");
        // untouched section keeps its defaults
        assert_eq!(cfg.recovery.account_prefix, "corral_recovery_");
    }

    #[test]
    fn section_with_a_single_field_defaults_the_rest() {
        let cfg = OrchestratorConfig::from_toml_str(
            "[convergence]\npoll_interval_ms = 250\n",
        )
        .unwrap();
        assert_eq!(cfg.convergence.poll_interval_ms, 250);
        assert_eq!(cfg.convergence.timeout_ms, 60_000);
        assert_eq!(cfg.convergence.sync_timeout_ms, 120_000);

        let cfg = OrchestratorConfig::from_toml_str(
            "[channel]\nconnect_retry_secs = 7\n",
        )
        .unwrap();
        assert_eq!(cfg.channel.connect_retry_secs, 7);
        assert_eq!(cfg.channel.name, "clusterset_replication");
    }
}
