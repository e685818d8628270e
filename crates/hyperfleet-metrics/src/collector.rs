//! Metrics collector — trailing utilization windows per host.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use hyperfleet_cluster::{HostFilter, HostRegistry};
use hyperfleet_core::config::MetricsConfig;
use hyperfleet_core::{GatewayError, HostId, HostUtilization, MetricsSource};

/// Trailing average for one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostMetrics {
    pub host: HostId,
    pub cpu: f64,
    pub memory: f64,
    pub samples: usize,
}

/// Polls host utilization and keeps the last `trailing` samples per host.
pub struct MetricsCollector {
    source: Arc<dyn MetricsSource>,
    registry: Arc<HostRegistry>,
    windows: RwLock<HashMap<HostId, VecDeque<HostUtilization>>>,
    interval: Duration,
    trailing: usize,
    host_timeout: Duration,
}

impl MetricsCollector {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        registry: Arc<HostRegistry>,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            source,
            registry,
            windows: RwLock::new(HashMap::new()),
            interval: config.interval(),
            trailing: config.trailing.max(1),
            host_timeout: config.host_timeout(),
        }
    }

    /// Sample every Reachable host once, concurrently. Returns the number
    /// of hosts sampled successfully.
    pub async fn collect_once(&self) -> usize {
        let mut set = JoinSet::new();
        for view in self.registry.list(HostFilter::ReachableOnly) {
            let source = Arc::clone(&self.source);
            let timeout = self.host_timeout;
            set.spawn(async move {
                let result = tokio::time::timeout(timeout, source.sample(&view.spec))
                    .await
                    .unwrap_or(Err(GatewayError::Timeout(timeout)));
                (view.spec.name, result)
            });
        }

        let mut sampled = 0;
        while let Some(joined) = set.join_next().await {
            let Ok((host, result)) = joined else { continue };
            match result {
                Ok(sample) => {
                    self.record(&host, sample).await;
                    sampled += 1;
                }
                Err(e) => warn!(%host, error = %e, "utilization sample failed"),
            }
        }
        debug!(sampled, "utilization sampled");
        sampled
    }

    /// Push one sample into a host's window.
    pub async fn record(&self, host: &str, sample: HostUtilization) {
        let mut windows = self.windows.write().await;
        let window = windows.entry(host.to_string()).or_default();
        window.push_back(sample);
        while window.len() > self.trailing {
            window.pop_front();
        }
    }

    /// Trailing average for `host`, if it has any samples.
    pub async fn host_average(&self, host: &str) -> Option<HostUtilization> {
        let windows = self.windows.read().await;
        windows.get(host).and_then(average)
    }

    /// Mean of the trailing peak (max of cpu, memory) across `hosts`.
    ///
    /// An empty `hosts` list means every host with samples. Hosts without
    /// samples are skipped; `None` if none have any.
    pub async fn group_utilization(&self, hosts: &[HostId]) -> Option<f64> {
        let windows = self.windows.read().await;
        let peaks: Vec<f64> = windows
            .iter()
            .filter(|(host, _)| hosts.is_empty() || hosts.contains(*host))
            .filter_map(|(_, w)| average(w))
            .map(|u| u.peak())
            .collect();
        if peaks.is_empty() {
            return None;
        }
        Some(peaks.iter().sum::<f64>() / peaks.len() as f64)
    }

    /// Trailing averages for every sampled host, sorted by host.
    pub async fn snapshot(&self) -> Vec<HostMetrics> {
        let windows = self.windows.read().await;
        let mut out: Vec<HostMetrics> = windows
            .iter()
            .filter_map(|(host, w)| {
                average(w).map(|u| HostMetrics {
                    host: host.clone(),
                    cpu: u.cpu,
                    memory: u.memory,
                    samples: w.len(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.host.cmp(&b.host));
        out
    }

    /// Drop the window of a host that is no longer registered.
    pub async fn forget(&self, host: &str) {
        self.windows.write().await.remove(host);
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            trailing = self.trailing,
            "metrics collector started"
        );

        loop {
            self.collect_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    break;
                }
            }
        }
    }
}

fn average(window: &VecDeque<HostUtilization>) -> Option<HostUtilization> {
    if window.is_empty() {
        return None;
    }
    let n = window.len() as f64;
    let (cpu, memory) = window
        .iter()
        .fold((0.0, 0.0), |(c, m), s| (c + s.cpu, m + s.memory));
    Some(HostUtilization {
        cpu: cpu / n,
        memory: memory / n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hyperfleet_core::{GatewayResult, HostSpec, Protocol, Resources};
    use std::sync::Mutex;

    /// Returns queued samples per host, then errors.
    #[derive(Default)]
    struct ScriptedSource {
        samples: Mutex<HashMap<String, VecDeque<HostUtilization>>>,
    }

    impl ScriptedSource {
        fn push(&self, host: &str, cpu: f64, memory: f64) {
            self.samples
                .lock()
                .unwrap()
                .entry(host.to_string())
                .or_default()
                .push_back(HostUtilization { cpu, memory });
        }
    }

    #[async_trait]
    impl MetricsSource for ScriptedSource {
        async fn sample(&self, host: &HostSpec) -> GatewayResult<HostUtilization> {
            self.samples
                .lock()
                .unwrap()
                .get_mut(&host.name)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| GatewayError::Unreachable(host.name.clone()))
        }
    }

    fn spec(name: &str) -> HostSpec {
        HostSpec {
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            port: 22,
            protocol: Protocol::Ssh,
            hypervisor: "qemu".to_string(),
            user: None,
            capacity: Resources::new(8, 1 << 30, 0),
        }
    }

    fn setup(trailing: usize) -> (Arc<ScriptedSource>, Arc<HostRegistry>, MetricsCollector) {
        let source = Arc::new(ScriptedSource::default());
        let registry = Arc::new(HostRegistry::new());
        for name in ["kvm-1", "kvm-2"] {
            registry.register(spec(name)).unwrap();
            registry.mark_reachable(name).unwrap();
        }
        let config = MetricsConfig {
            trailing,
            ..MetricsConfig::default()
        };
        let collector = MetricsCollector::new(
            Arc::clone(&source) as Arc<dyn MetricsSource>,
            Arc::clone(&registry),
            &config,
        );
        (source, registry, collector)
    }

    #[tokio::test]
    async fn window_keeps_trailing_samples() {
        let (_source, _registry, collector) = setup(2);
        collector.record("kvm-1", HostUtilization { cpu: 1.0, memory: 0.0 }).await;
        collector.record("kvm-1", HostUtilization { cpu: 0.4, memory: 0.2 }).await;
        collector.record("kvm-1", HostUtilization { cpu: 0.2, memory: 0.4 }).await;

        let avg = collector.host_average("kvm-1").await.unwrap();
        assert!((avg.cpu - 0.3).abs() < 1e-9);
        assert!((avg.memory - 0.3).abs() < 1e-9);
        assert_eq!(collector.snapshot().await[0].samples, 2);
    }

    #[tokio::test]
    async fn collect_samples_reachable_hosts_only() {
        let (source, registry, collector) = setup(5);
        source.push("kvm-1", 0.5, 0.1);
        source.push("kvm-2", 0.9, 0.9);
        registry.mark_unreachable("kvm-2").unwrap();

        assert_eq!(collector.collect_once().await, 1);
        assert!(collector.host_average("kvm-2").await.is_none());
        assert_eq!(collector.host_average("kvm-1").await.unwrap().cpu, 0.5);
    }

    #[tokio::test]
    async fn failed_samples_are_skipped() {
        let (_source, _registry, collector) = setup(5);
        assert_eq!(collector.collect_once().await, 0);
        assert!(collector.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn group_utilization_averages_peaks() {
        let (_source, _registry, collector) = setup(5);
        collector.record("kvm-1", HostUtilization { cpu: 0.8, memory: 0.2 }).await;
        collector.record("kvm-2", HostUtilization { cpu: 0.1, memory: 0.4 }).await;

        let all = collector.group_utilization(&[]).await.unwrap();
        assert!((all - 0.6).abs() < 1e-9);
        let one = collector.group_utilization(&["kvm-2".into()]).await.unwrap();
        assert!((one - 0.4).abs() < 1e-9);
        assert!(collector.group_utilization(&["kvm-9".into()]).await.is_none());
    }
}
