//! Background probe loops, one per host.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use hyperfleet_cluster::{HostFilter, HostRegistry, Liveness};
use hyperfleet_core::HostId;
use hyperfleet_core::config::HealthCheckConfig;

use crate::checker::{HealthTracker, ProbeResult, tcp_probe};

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Keeps host liveness in the registry current.
pub struct HostHealthChecker {
    registry: Arc<HostRegistry>,
    config: HealthCheckConfig,
    monitors: Arc<RwLock<HashMap<HostId, MonitorSlot>>>,
}

impl HostHealthChecker {
    pub fn new(registry: Arc<HostRegistry>, config: HealthCheckConfig) -> Self {
        Self {
            registry,
            config,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Probe every registered host once, concurrently, and apply the
    /// results directly. Used at startup so the first placement pass has
    /// liveness to work with. Returns the number of reachable hosts.
    pub async fn probe_all(&self) -> usize {
        let timeout = self.config.timeout();
        let mut probes = JoinSet::new();
        for view in self.registry.list(HostFilter::All) {
            probes.spawn(async move {
                let result = tcp_probe(&view.spec.socket_addr(), timeout).await;
                (view.spec.name, result)
            });
        }

        let mut reachable = 0;
        while let Some(joined) = probes.join_next().await {
            let Ok((host, result)) = joined else { continue };
            let outcome = if result.is_success() {
                reachable += 1;
                self.registry.mark_reachable(&host)
            } else {
                self.registry.mark_unreachable(&host)
            };
            if let Err(e) = outcome {
                error!(%host, error = %e, "failed to record probe result");
            }
        }
        info!(reachable, hosts = self.registry.len(), "initial host probe complete");
        reachable
    }

    /// Start a probe loop for every registered host.
    pub async fn start(&self) {
        for view in self.registry.list(HostFilter::All) {
            self.start_monitor(&view.spec.name).await;
        }
    }

    /// Start (or restart) the probe loop for one host.
    pub async fn start_monitor(&self, host: &str) {
        let Ok(spec) = self.registry.spec(host) else {
            error!(host, "cannot monitor unregistered host");
            return;
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let mut tracker = HealthTracker::new(&self.config);
        // Seed from the registry so a host already probed at startup
        // doesn't start over at Unknown.
        if registry.liveness(host).ok() == Some(Liveness::Reachable) {
            tracker.record(ProbeResult::Reachable);
        }
        let timeout = self.config.timeout();

        let addr = spec.socket_addr();
        let handle = tokio::spawn(async move {
            run_probe_loop(spec.name, addr, tracker, timeout, registry, shutdown_rx)
                .await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            host.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        debug!(host, "health monitor started");
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (host, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%host, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<HostId> {
        let mut hosts: Vec<_> = self.monitors.read().await.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

async fn run_probe_loop(
    host: HostId,
    address: String,
    mut tracker: HealthTracker,
    timeout: Duration,
    registry: Arc<HostRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%host, %address, "probe loop starting");

    loop {
        let result = tcp_probe(&address, timeout).await;
        let previous = tracker.liveness();
        let liveness = tracker.record(result);

        if liveness != previous || liveness != registry.liveness(&host).unwrap_or_default() {
            let applied = match liveness {
                Liveness::Reachable => registry.mark_reachable(&host),
                Liveness::Unreachable => registry.mark_unreachable(&host),
                Liveness::Unknown => Ok(()),
            };
            if let Err(e) = applied {
                error!(%host, error = %e, "failed to update host liveness");
            }
        } else if liveness == Liveness::Reachable {
            // Refresh last-contact time.
            let _ = registry.mark_reachable(&host);
        }

        tokio::select! {
            _ = tokio::time::sleep(tracker.next_interval()) => {}
            _ = shutdown.changed() => {
                debug!(%host, "probe loop shutting down");
                break;
            }
        }
    }
}
