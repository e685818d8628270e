//! Host registry — known hosts, liveness and committed capacity.
//!
//! The host map is written only at registration; everything after that
//! takes the map's read lock plus the one host's own mutex, so the
//! planner reserving on host A never waits on a health check of host B.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use hyperfleet_core::{HostId, HostSpec, Resources, epoch_secs};

use crate::error::{RegistryError, RegistryResult};

/// Liveness as last observed by the health checker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFilter {
    ReachableOnly,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacitySnapshot {
    pub capacity: Resources,
    pub allocated: Resources,
    pub free: Resources,
}

/// Point-in-time copy of one host's registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    pub spec: HostSpec,
    pub liveness: Liveness,
    pub capacity: CapacitySnapshot,
    /// Epoch seconds of the last successful probe.
    pub last_contact: Option<u64>,
}

#[derive(Debug)]
struct HostEntry {
    spec: HostSpec,
    liveness: Liveness,
    allocated: Resources,
    last_contact: Option<u64>,
}

impl HostEntry {
    fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            capacity: self.spec.capacity,
            allocated: self.allocated,
            free: self.spec.capacity.saturating_sub(&self.allocated),
        }
    }

    fn view(&self) -> HostView {
        HostView {
            spec: self.spec.clone(),
            liveness: self.liveness,
            capacity: self.snapshot(),
            last_contact: self.last_contact,
        }
    }
}

/// Process-wide registry of hypervisor hosts.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<HostId, Mutex<HostEntry>>>,
}

/// Lock a host entry, recovering the guard if a holder panicked.
fn lock(entry: &Mutex<HostEntry>) -> MutexGuard<'_, HostEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host. Liveness starts as `Unknown` until the first probe.
    pub fn register(&self, spec: HostSpec) -> RegistryResult<()> {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        if hosts.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateHost(spec.name));
        }
        info!(host = %spec.name, uri = %spec.connection_uri(), capacity = %spec.capacity, "host registered");
        hosts.insert(
            spec.name.clone(),
            Mutex::new(HostEntry {
                spec,
                liveness: Liveness::Unknown,
                allocated: Resources::ZERO,
                last_contact: None,
            }),
        );
        Ok(())
    }

    /// Hosts matching `filter`, sorted by name.
    pub fn list(&self, filter: HostFilter) -> Vec<HostView> {
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        let mut views: Vec<HostView> = hosts
            .values()
            .map(|entry| lock(entry).view())
            .filter(|view| match filter {
                HostFilter::All => true,
                HostFilter::ReachableOnly => view.liveness == Liveness::Reachable,
            })
            .collect();
        views.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        views
    }

    pub fn get(&self, host: &str) -> RegistryResult<HostView> {
        self.with_host(host, |entry| entry.view())
    }

    pub fn spec(&self, host: &str) -> RegistryResult<HostSpec> {
        self.with_host(host, |entry| entry.spec.clone())
    }

    pub fn capacity_snapshot(&self, host: &str) -> RegistryResult<CapacitySnapshot> {
        self.with_host(host, |entry| entry.snapshot())
    }

    pub fn liveness(&self, host: &str) -> RegistryResult<Liveness> {
        self.with_host(host, |entry| entry.liveness)
    }

    pub fn last_contact(&self, host: &str) -> RegistryResult<Option<u64>> {
        self.with_host(host, |entry| entry.last_contact)
    }

    pub fn mark_reachable(&self, host: &str) -> RegistryResult<()> {
        self.with_host(host, |entry| {
            if entry.liveness != Liveness::Reachable {
                info!(host, previous = ?entry.liveness, "host reachable");
            }
            entry.liveness = Liveness::Reachable;
            entry.last_contact = Some(epoch_secs());
        })
    }

    pub fn mark_unreachable(&self, host: &str) -> RegistryResult<()> {
        self.with_host(host, |entry| {
            if entry.liveness != Liveness::Unreachable {
                warn!(host, previous = ?entry.liveness, "host unreachable");
            }
            entry.liveness = Liveness::Unreachable;
        })
    }

    /// Commit `res` against `host` if it fits in the host's free capacity.
    ///
    /// The check and the commit happen under the host's lock, so two
    /// placements racing for the last slot cannot both succeed.
    pub fn reserve(&self, host: &str, res: &Resources) -> RegistryResult<CapacitySnapshot> {
        self.with_host(host, |entry| {
            let free = entry.spec.capacity.saturating_sub(&entry.allocated);
            if !res.fits_within(&free) {
                return Err(RegistryError::InsufficientCapacity {
                    host: host.to_string(),
                    requested: *res,
                    free,
                });
            }
            entry.allocated = entry.allocated.saturating_add(res);
            debug!(host, reserved = %res, allocated = %entry.allocated, "capacity reserved");
            Ok(entry.snapshot())
        })?
    }

    /// Commit `res` regardless of free capacity.
    ///
    /// Used when rebuilding allocations for VMs that already exist; the
    /// hosts may be overcommitted if capacities shrank across a restart.
    pub fn force_reserve(&self, host: &str, res: &Resources) -> RegistryResult<CapacitySnapshot> {
        self.with_host(host, |entry| {
            entry.allocated = entry.allocated.saturating_add(res);
            if !entry.allocated.fits_within(&entry.spec.capacity) {
                warn!(host, allocated = %entry.allocated, capacity = %entry.spec.capacity, "host overcommitted");
            }
            entry.snapshot()
        })
    }

    pub fn release(&self, host: &str, res: &Resources) -> RegistryResult<CapacitySnapshot> {
        self.with_host(host, |entry| {
            if !res.fits_within(&entry.allocated) {
                warn!(host, releasing = %res, allocated = %entry.allocated, "release exceeds allocation");
            }
            entry.allocated = entry.allocated.saturating_sub(res);
            debug!(host, released = %res, allocated = %entry.allocated, "capacity released");
            entry.snapshot()
        })
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_host<T>(&self, host: &str, f: impl FnOnce(&mut HostEntry) -> T) -> RegistryResult<T> {
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        let entry = hosts
            .get(host)
            .ok_or_else(|| RegistryError::UnknownHost(host.to_string()))?;
        let mut guard = lock(entry);
        Ok(f(&mut guard))
    }
}
