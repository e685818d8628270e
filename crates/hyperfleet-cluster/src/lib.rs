//! hyperfleet-cluster — the host registry.
//!
//! Tracks every configured hypervisor host, its liveness as seen by the
//! health checker, and the capacity committed to it by placements. The
//! registry is in-memory only; after a restart the engine rebuilds
//! allocations from persisted instances.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{CapacitySnapshot, HostFilter, HostRegistry, HostView, Liveness};
