//! Host scoring for placement decisions.
//!
//! A host is eligible when it is reachable, belongs to the group's host
//! pool, and has at least the requested amount free on every dimension.
//! Eligible hosts are ordered by how full they would be after placement:
//! - **most-allocated** (bin-packing): fullest first, so empty hosts stay empty
//! - **least-allocated** (spread): emptiest first
//!
//! Ties break on host name so the order is deterministic.

use std::cmp::Ordering;

use hyperfleet_cluster::{HostView, Liveness};
use hyperfleet_core::{HostId, PlacementOrder, Resources};

/// Scored placement candidate.
#[derive(Debug, Clone)]
pub struct HostScore {
    pub host: HostId,
    /// Projected fill after placement, averaged over CPU and memory.
    /// Range: 0.0..=100.0.
    pub fill: f64,
}

/// Whether `host` may receive an instance of size `req` for a group
/// restricted to `pool` (empty pool = every host).
pub fn is_eligible(host: &HostView, req: &Resources, pool: &[HostId]) -> bool {
    host.liveness == Liveness::Reachable
        && (pool.is_empty() || pool.iter().any(|h| *h == host.spec.name))
        && req.fits_within(&host.capacity.free)
}

fn ratio(used: u64, capacity: u64) -> Option<f64> {
    (capacity > 0).then(|| (used as f64 / capacity as f64).min(1.0))
}

/// Score a single host, or `None` if it is not eligible.
pub fn score_host(host: &HostView, req: &Resources, pool: &[HostId]) -> Option<HostScore> {
    if !is_eligible(host, req, pool) {
        return None;
    }

    let projected = host.capacity.allocated.saturating_add(req);
    let cap = &host.capacity.capacity;
    let dims: Vec<f64> = [
        ratio(u64::from(projected.cpu_cores), u64::from(cap.cpu_cores)),
        ratio(projected.memory_bytes, cap.memory_bytes),
    ]
    .into_iter()
    .flatten()
    .collect();
    let fill = if dims.is_empty() {
        50.0
    } else {
        dims.iter().sum::<f64>() / dims.len() as f64 * 100.0
    };

    Some(HostScore {
        host: host.spec.name.clone(),
        fill,
    })
}

/// Score every host and return the eligible ones in placement order.
pub fn rank_hosts(
    hosts: &[HostView],
    req: &Resources,
    pool: &[HostId],
    order: PlacementOrder,
) -> Vec<HostScore> {
    let mut scores: Vec<HostScore> = hosts
        .iter()
        .filter_map(|h| score_host(h, req, pool))
        .collect();

    scores.sort_by(|a, b| {
        let by_fill = match order {
            PlacementOrder::MostAllocated => b.fill.partial_cmp(&a.fill),
            PlacementOrder::LeastAllocated => a.fill.partial_cmp(&b.fill),
        };
        by_fill
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.host.cmp(&b.host))
    });
    scores
}
