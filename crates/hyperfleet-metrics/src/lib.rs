//! hyperfleet-metrics — host utilization and controller observability.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── collect_once() ← samples every Reachable host via MetricsSource
//!   ├── trailing window per host (last `trailing` samples)
//!   ├── group_utilization() → feeds the autoscale policy
//!   └── run() → periodic sampling loop
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{HostMetrics, MetricsCollector};
pub use prometheus::render_prometheus;
