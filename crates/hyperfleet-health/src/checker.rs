//! Probe logic and per-host liveness tracking.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use hyperfleet_cluster::Liveness;
use hyperfleet_core::config::HealthCheckConfig;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The hypervisor port accepted a connection.
    Reachable,
    /// The connection was refused or failed.
    Failed,
    TimedOut,
}

impl ProbeResult {
    pub fn is_success(self) -> bool {
        self == ProbeResult::Reachable
    }
}

/// Tracks consecutive probe results for one host.
#[derive(Debug)]
pub struct HealthTracker {
    liveness: Liveness,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
}

impl HealthTracker {
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self::with_threshold(config.unhealthy_threshold, config.interval())
    }

    pub fn with_threshold(unhealthy_threshold: u32, interval: Duration) -> Self {
        Self {
            liveness: Liveness::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
        }
    }

    /// Record a probe result and return the resulting liveness.
    pub fn record(&mut self, result: ProbeResult) -> Liveness {
        if result.is_success() {
            self.consecutive_failures = 0;
            self.current_backoff = self.base_interval;
            self.liveness = Liveness::Reachable;
            return self.liveness;
        }

        self.consecutive_failures += 1;
        self.current_backoff = (self.current_backoff * 2).min(MAX_BACKOFF.max(self.base_interval));
        if self.consecutive_failures >= self.unhealthy_threshold {
            self.liveness = Liveness::Unreachable;
        }
        self.liveness
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// Open (and immediately close) a TCP connection to `address`.
pub async fn tcp_probe(address: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => ProbeResult::Reachable,
        Ok(Err(e)) => {
            debug!(%address, error = %e, "probe connection failed");
            ProbeResult::Failed
        }
        Err(_) => {
            warn!(%address, timeout_ms = timeout.as_millis() as u64, "probe timed out");
            ProbeResult::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_unknown() {
        let tracker = HealthTracker::new(&HealthCheckConfig::default());
        assert_eq!(tracker.liveness(), Liveness::Unknown);
        assert_eq!(tracker.next_interval(), Duration::from_secs(10));
    }

    #[test]
    fn one_success_marks_reachable() {
        let mut tracker = HealthTracker::with_threshold(3, Duration::from_secs(1));
        for _ in 0..3 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.liveness(), Liveness::Unreachable);
        assert_eq!(tracker.record(ProbeResult::Reachable), Liveness::Reachable);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn unreachable_only_at_threshold() {
        let mut tracker = HealthTracker::with_threshold(3, Duration::from_secs(1));
        tracker.record(ProbeResult::Reachable);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.record(ProbeResult::TimedOut), Liveness::Reachable);
        assert_eq!(tracker.record(ProbeResult::Failed), Liveness::Unreachable);
    }

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut tracker = HealthTracker::with_threshold(100, Duration::from_secs(1));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        for _ in 0..10 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.next_interval(), Duration::from_secs(60));

        tracker.record(ProbeResult::Reachable);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn probe_open_and_closed_ports() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();
        assert_eq!(tcp_probe(&open, Duration::from_secs(1)).await, ProbeResult::Reachable);

        drop(listener);
        assert_ne!(tcp_probe(&open, Duration::from_secs(1)).await, ProbeResult::Reachable);
    }
}
