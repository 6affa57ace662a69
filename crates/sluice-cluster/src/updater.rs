//! Periodic host-info updater workers.
//!
//! Each host in a cluster gets one background worker that probes the host at
//! a fixed interval, refreshing liveness and (when the probe reports it) the
//! host's resource budget. Workers are started and stopped by the owning
//! [`Cluster`](crate::Cluster); stop is awaited, never fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::host::Host;
use crate::resources::HostResources;

/// Result of probing a host.
pub enum ProbeResult {
    /// The host responded; the payload, when present, replaces the host's
    /// total resource budget.
    Alive(Option<HostResources>),
    Unreachable,
}

/// Probes a host for liveness and, optionally, an updated resource budget.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn probe(&self, host: &Host) -> ProbeResult;
}

/// Probes a remote node by running a trivial command over ssh.
///
/// Liveness only: the remote budget is taken from configuration, not
/// re-discovered. `BatchMode` keeps a dead host from hanging on a password
/// prompt.
pub struct SshProbe {
    pub connect_timeout: Duration,
}

impl Default for SshProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl HostProbe for SshProbe {
    async fn probe(&self, host: &Host) -> ProbeResult {
        let result = tokio::time::timeout(
            self.connect_timeout,
            tokio::process::Command::new("ssh")
                .args(["-o", "BatchMode=yes", host.name(), "true"])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status(),
        )
        .await;

        match result {
            Ok(Ok(status)) if status.success() => ProbeResult::Alive(None),
            _ => ProbeResult::Unreachable,
        }
    }
}

/// A probe with a fixed answer, for tests and for local clusters where every
/// host is known to be up.
pub struct StaticProbe {
    pub alive: bool,
}

#[async_trait]
impl HostProbe for StaticProbe {
    async fn probe(&self, _host: &Host) -> ProbeResult {
        if self.alive {
            ProbeResult::Alive(None)
        } else {
            ProbeResult::Unreachable
        }
    }
}

/// One refresh cycle: probe the host and apply the result.
pub(crate) async fn refresh_host(host: &Host, probe: &dyn HostProbe) {
    match probe.probe(host).await {
        ProbeResult::Alive(refreshed) => host.mark_alive(refreshed),
        ProbeResult::Unreachable => {
            if host.is_alive() {
                tracing::warn!(host = host.name(), "host became unreachable");
            }
            host.mark_unreachable();
        }
    }
}

/// Run the periodic refresh loop for one host until `shutdown` flips to true.
pub(crate) async fn updater_loop(
    host: Arc<Host>,
    probe: Arc<dyn HostProbe>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => refresh_host(&host, probe.as_ref()).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(host = host.name(), "host info updater stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_probe_marks_host_alive() {
        let host = Host::new("node1", HostResources::new(4, 0, 0));
        host.mark_unreachable();

        refresh_host(&host, &StaticProbe { alive: true }).await;
        assert!(host.is_alive());
        assert!(host.last_seen().is_some());
    }

    #[tokio::test]
    async fn failed_probe_marks_host_unreachable() {
        let host = Host::new("node1", HostResources::new(4, 0, 0));
        assert!(host.is_alive());

        refresh_host(&host, &StaticProbe { alive: false }).await;
        assert!(!host.is_alive());
    }

    #[tokio::test]
    async fn updater_loop_stops_on_shutdown() {
        let host = Arc::new(Host::new("node1", HostResources::new(1, 0, 0)));
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(updater_loop(
            host,
            Arc::new(StaticProbe { alive: true }),
            Duration::from_millis(10),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("updater did not stop")
            .unwrap();
    }
}
