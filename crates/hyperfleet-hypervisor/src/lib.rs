//! hyperfleet-hypervisor — adapters from the controller's narrow traits
//! to libvirt hosts.
//!
//! Both adapters drive the `virsh` client against a per-host connection
//! URI (`qemu+ssh://user@addr:port/system` or `qemu+tls://addr:port/system`).
//! Domains are named after the stable instance ID, which is what makes
//! [`VirshGateway::create`](hyperfleet_core::VmGateway::create) safe to repeat.
//! Groups with guest setup also get a NoCloud seed volume per instance.

pub mod domain;
pub mod gateway;
pub mod metrics;
pub mod seed;
pub mod virsh;

pub use gateway::VirshGateway;
pub use metrics::VirshMetrics;
pub use seed::SeedBuilder;
pub use virsh::Virsh;
