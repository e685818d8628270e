//! hyperfleet-autoscale — utilization-driven group scaling.
//!
//! Used in standalone mode, where no external orchestrator drives the
//! desired size. Reads the trailing utilization of each group's hosts
//! from the [`MetricsCollector`](hyperfleet_metrics::MetricsCollector)
//! and moves the group's desired size one `increment` at a time.
//!
//! # Scaling Algorithm
//!
//! ```text
//! utilization = mean over the group's hosts of max(cpu, mem)
//!
//! if utilization > high_water and desired < max:
//!     ScaleTo(min(desired + increment, max))
//!
//! if utilization < low_water and desired > min:
//!     ScaleTo(max(desired - increment, min))
//! ```
//!
//! At most one change per group per `cooldown`, in either direction.

pub mod scaler;

pub use scaler::{Autoscaler, ScaleDecision, ScalingPolicy};
