//! hyperfleet-health — host liveness for the placement planner.
//!
//! Each registered host gets a background task that probes its
//! hypervisor port over TCP and feeds the result into the host registry.
//!
//! # Architecture
//!
//! ```text
//! HostHealthChecker
//!   └── Per-host background task
//!       ├── HealthTracker (consecutive failures, backoff)
//!       ├── tcp_probe() → ProbeResult
//!       └── HostRegistry::mark_reachable / mark_unreachable
//! ```
//!
//! A single successful probe marks a host Reachable. `unhealthy_threshold`
//! consecutive failures mark it Unreachable, which removes it from
//! placement. While a host keeps failing, the probe interval doubles up
//! to 60s.

pub mod checker;
pub mod monitor;

pub use checker::{HealthTracker, ProbeResult, tcp_probe};
pub use monitor::HostHealthChecker;
