//! Placement planner — first-fit with capacity reservation.
//!
//! The planner ranks hosts from a registry snapshot, then walks the
//! ranking reserving capacity on each candidate in turn. A reservation
//! can lose a race against another group placing concurrently; the
//! planner then moves on to the next host.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use hyperfleet_cluster::{HostFilter, HostRegistry, RegistryError};
use hyperfleet_core::{HostId, PlacementOrder, Resources};

use crate::error::{PlacementError, PlacementResult};
use crate::scorer::rank_hosts;

/// A successful placement. Capacity is already reserved on `host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub host: HostId,
    pub reserved: Resources,
}

pub struct PlacementPlanner {
    registry: Arc<HostRegistry>,
    order: PlacementOrder,
}

impl PlacementPlanner {
    pub fn new(registry: Arc<HostRegistry>, order: PlacementOrder) -> Self {
        Self { registry, order }
    }

    pub fn order(&self) -> PlacementOrder {
        self.order
    }

    /// Pick a host for one instance of `group` and reserve `req` on it.
    pub fn place(
        &self,
        group: &str,
        req: &Resources,
        pool: &[HostId],
    ) -> PlacementResult<Placement> {
        let hosts = self.registry.list(HostFilter::ReachableOnly);
        let ranked = rank_hosts(&hosts, req, pool, self.order);

        for candidate in &ranked {
            match self.registry.reserve(&candidate.host, req) {
                Ok(snapshot) => {
                    debug!(
                        group,
                        host = %candidate.host,
                        fill = candidate.fill,
                        free = %snapshot.free,
                        "instance placed"
                    );
                    return Ok(Placement {
                        host: candidate.host.clone(),
                        reserved: *req,
                    });
                }
                Err(RegistryError::InsufficientCapacity { .. }) => {
                    debug!(group, host = %candidate.host, "lost reservation race; trying next host");
                }
                Err(e) => {
                    warn!(group, host = %candidate.host, error = %e, "reservation failed");
                }
            }
        }

        Err(PlacementError::CapacityExhausted {
            group: group.to_string(),
            requested: *req,
            considered: hosts.len(),
        })
    }

    /// Return a placement's reservation to its host.
    pub fn release(&self, host: &str, reserved: &Resources) {
        if let Err(e) = self.registry.release(host, reserved) {
            warn!(host, error = %e, "failed to release capacity");
        }
    }
}
