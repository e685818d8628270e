//! hyperfleet-core — shared vocabulary for the hyperfleet workspace.
//!
//! Holds the controller configuration (`hyperfleet.toml`), the resource
//! and template types every other crate speaks, and the two narrow traits
//! through which the controller reaches hypervisors: [`VmGateway`] for
//! VM lifecycle and [`MetricsSource`] for host utilization.

pub mod config;
pub mod duration;
pub mod gateway;
pub mod types;

pub use config::{ConfigError, ControllerConfig};
pub use duration::{epoch_secs, parse_bytes, parse_duration};
pub use gateway::{GatewayError, GatewayResult, MetricsSource, VmGateway};
pub use types::*;
