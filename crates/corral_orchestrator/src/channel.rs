//! Replication channel configuration.
//!
//! A replica cluster's channel must always point at the *current* primary
//! instance of the *current* primary cluster of its set — never a stale
//! endpoint. Repointing is: stop the channel if active, rewrite source
//! endpoint and credential, start it, then wait until the applier reports
//! actively applying with no error.

use std::time::Duration;

use corral_common::types::{CredentialRef, Endpoint};
use corral_common::{CancelToken, CorralResult};
use corral_topology::model::ReplicationChannel;

use crate::convergence::Convergence;
use crate::probe::InstanceProbe;
use crate::session::{AdminCommand, ConnectionProvider};

/// Establishes, repoints and tears down cluster-set replication channels.
pub struct ChannelConfigurator<'a> {
    provider: &'a dyn ConnectionProvider,
    probe: &'a dyn InstanceProbe,
    admin_credential: &'a CredentialRef,
    connect_retry_secs: u32,
    poll_interval: Duration,
    timeout: Duration,
}

impl<'a> ChannelConfigurator<'a> {
    pub fn new(
        provider: &'a dyn ConnectionProvider,
        probe: &'a dyn InstanceProbe,
        admin_credential: &'a CredentialRef,
        connect_retry_secs: u32,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            probe,
            admin_credential,
            connect_retry_secs,
            poll_interval,
            timeout,
        }
    }

    /// Configure and start `channel` on its subscriber, then wait until
    /// it reports actively applying.
    ///
    /// The same sequence serves both first establishment and repointing:
    /// stop (no-op if not running) → rewrite source + credential → start
    /// → verify applying.
    pub fn apply(&self, channel: &ReplicationChannel, cancel: &CancelToken) -> CorralResult<()> {
        tracing::info!(
            channel = %channel.name,
            subscriber = %channel.subscriber,
            source = %channel.source,
            "configuring replication channel"
        );
        let mut session = self
            .provider
            .open(&channel.subscriber, self.admin_credential)?;
        session.execute(AdminCommand::StopChannel {
            name: channel.name.clone(),
        })?;
        session.execute(AdminCommand::ConfigureChannel {
            name: channel.name.clone(),
            source: channel.source.clone(),
            credential: channel.credential.clone(),
            connect_retry_secs: self.connect_retry_secs,
            applier_delay_secs: channel.applier_delay_secs,
        })?;
        session.execute(AdminCommand::StartChannel {
            name: channel.name.clone(),
        })?;
        drop(session);

        self.wait_applying(channel, cancel)
    }

    /// Stop and deconfigure the channel on `subscriber`. Idempotent: a
    /// node with no such channel accepts both commands as no-ops.
    pub fn teardown(
        &self,
        subscriber: &Endpoint,
        channel: &ReplicationChannel,
    ) -> CorralResult<()> {
        tracing::info!(
            channel = %channel.name,
            subscriber = %subscriber,
            "tearing down replication channel"
        );
        let mut session = self.provider.open(subscriber, self.admin_credential)?;
        session.execute(AdminCommand::StopChannel {
            name: channel.name.clone(),
        })?;
        session.execute(AdminCommand::ResetChannel {
            name: channel.name.clone(),
        })?;
        Ok(())
    }

    /// Poll the subscriber until the channel reports applying with no
    /// error and the expected source endpoint.
    fn wait_applying(&self, channel: &ReplicationChannel, cancel: &CancelToken) -> CorralResult<()> {
        let conv = Convergence::new(self.probe, self.poll_interval, self.timeout, cancel);
        conv.wait_until(&channel.subscriber, "channel applying", |reading| {
            reading
                .channels
                .get(&channel.name.0)
                .is_some_and(|ch| ch.applying && ch.last_error.is_none() && ch.source == channel.source)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFleet;
    use corral_common::types::{ChannelName, ClusterId};

    fn channel_to(
        cluster: ClusterId,
        source: &Endpoint,
        subscriber: &Endpoint,
        cred: &str,
    ) -> ReplicationChannel {
        ReplicationChannel {
            name: ChannelName("clusterset_replication".into()),
            cluster,
            source: source.clone(),
            subscriber: subscriber.clone(),
            credential: CredentialRef(cred.into()),
            applier_delay_secs: 0,
        }
    }

    fn configurator<'a>(fleet: &'a SimFleet, cred: &'a CredentialRef) -> ChannelConfigurator<'a> {
        ChannelConfigurator::new(
            fleet,
            fleet,
            cred,
            3,
            Duration::from_millis(1),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn establish_then_repoint_updates_source() {
        let fleet = SimFleet::new();
        let admin = fleet.admin_credential();
        let src_a = fleet.add_node("pa", 3306);
        let src_b = fleet.add_node("pb", 3306);
        let sub = fleet.add_node("r", 3306);
        fleet.bootstrap_group(&src_a);
        fleet.bootstrap_group(&src_b);
        fleet.bootstrap_group(&sub);
        let cred = fleet.mint_credential("repl-1");

        let cfg = configurator(&fleet, &admin);
        let cancel = CancelToken::new();

        let mut ch = channel_to(ClusterId(2), &src_a, &sub, &cred.0);
        cfg.apply(&ch, &cancel).unwrap();
        assert_eq!(fleet.channel_source(&sub).as_ref(), Some(&src_a));

        // Repoint to a new source; same stop/configure/start sequence.
        ch.source = src_b.clone();
        cfg.apply(&ch, &cancel).unwrap();
        assert_eq!(fleet.channel_source(&sub).as_ref(), Some(&src_b));
        assert!(fleet.channel_running(&sub));
    }

    #[test]
    fn teardown_is_idempotent() {
        let fleet = SimFleet::new();
        let admin = fleet.admin_credential();
        let src = fleet.add_node("p", 3306);
        let sub = fleet.add_node("r", 3306);
        fleet.bootstrap_group(&src);
        fleet.bootstrap_group(&sub);
        let cred = fleet.mint_credential("repl-1");

        let cfg = configurator(&fleet, &admin);
        let cancel = CancelToken::new();
        let ch = channel_to(ClusterId(2), &src, &sub, &cred.0);
        cfg.apply(&ch, &cancel).unwrap();

        cfg.teardown(&sub, &ch).unwrap();
        assert!(fleet.channel_source(&sub).is_none());
        // Second teardown finds nothing to do and still succeeds.
        cfg.teardown(&sub, &ch).unwrap();
    }

    #[test]
    fn unknown_credential_is_a_remote_error() {
        let fleet = SimFleet::new();
        let admin = fleet.admin_credential();
        let src = fleet.add_node("p", 3306);
        let sub = fleet.add_node("r", 3306);
        fleet.bootstrap_group(&src);
        fleet.bootstrap_group(&sub);

        let cfg = configurator(&fleet, &admin);
        let cancel = CancelToken::new();
        let ch = channel_to(ClusterId(2), &src, &sub, "never-minted");
        let err = cfg.apply(&ch, &cancel).unwrap_err();
        assert!(matches!(err, corral_common::CorralError::Remote { .. }));
    }
}
