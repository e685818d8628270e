//! hyperfleetd — the hyperfleet daemon.
//!
//! Assembles every subsystem into one process:
//! - State store (redb) and autoscaling group store
//! - Host registry and health checker
//! - Reconciliation engine over the virsh gateway
//! - A scaling driver for the selected run mode
//! - Scaling protocol API, status and Prometheus metrics
//!
//! # Startup order
//!
//! ```text
//! config ─► StateStore ─► GroupStore.sync ─► HostRegistry
//!        ─► initial host probe ─► engine recovery
//!        ─► health loops, engine loop, driver tasks, API server
//! ```
//!
//! # Run modes
//!
//! | Mode | Who moves desired size |
//! |---|---|
//! | `kubernetes` | the orchestrator, through the scaling API |
//! | `standalone` | the threshold autoscaler, from sampled host utilization |

pub mod controller;
pub mod driver;
pub mod logging;

pub use controller::Controller;
pub use driver::{KubernetesDriver, ScalingDriver, StandaloneDriver};
pub use logging::LogFormat;
