//! Reconciliation engine — the level-triggered control loop.
//!
//! Each tick, every group is reconciled concurrently in three phases:
//!
//! 1. **Plan** (group lock held): take one snapshot, compute
//!    `delta = desired - (Running + Provisioning)`, allocate and place new
//!    instances or pick oldest-first victims, and decide which in-flight
//!    instances need another create, poll or destroy. A group with static
//!    addressing hands each placed instance the lowest free address of its
//!    range. State changes made here commit in one batch before any
//!    gateway call.
//! 2. **Execute** (no group lock): gateway calls run concurrently, capped
//!    per host and bounded by a timeout.
//! 3. **Apply** (group lock held): fold the outcomes back into the store.
//!
//! A failed action leaves the instance in its pre-call state and schedules
//! a retry with exponential backoff. Creates that exhaust the retry budget
//! move the instance to `Failed`; the next tick sees the group short by one
//! and allocates a replacement.
//!
//! A create that timed out may still have built its VM. A `Failed`
//! instance therefore keeps its host reservation and is marked
//! `cleanup_pending`; later ticks destroy the VM through the gateway's
//! derived reference, with the same backoff, and release the capacity only
//! once the destroy succeeds.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use hyperfleet_cluster::HostRegistry;
use hyperfleet_core::config::ReconciliationConfig;
use hyperfleet_core::{
    GatewayError, GatewayResult, GroupId, HostId, HostSpec, InstanceId, InstanceTemplate,
    PlacementOrder, VmGateway, VmRef, VmStatus, epoch_secs,
};
use hyperfleet_placement::{PlacementError, PlacementPlanner};
use hyperfleet_state::{InstanceRecord, InstanceState, StateBatch, StateError};

use crate::error::{EngineError, EngineResult, GroupError};
use crate::groups::{GroupGuard, GroupSnapshot, GroupStore};
use crate::retry::{RetryBook, RetryPolicy};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub interval: Duration,
    pub retry: RetryPolicy,
    pub gateway_timeout: Duration,
    /// Concurrent gateway calls allowed per host.
    pub host_concurrency: usize,
    /// How long placement may fail before it is logged as an error.
    pub exhaustion_alert_after: Duration,
    pub placement_order: PlacementOrder,
}

impl EngineConfig {
    pub fn from_config(cfg: &ReconciliationConfig, placement_order: PlacementOrder) -> Self {
        Self {
            interval: cfg.interval(),
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                base: cfg.backoff_base(),
                max: cfg.backoff_max(),
            },
            gateway_timeout: cfg.gateway_timeout(),
            host_concurrency: cfg.host_concurrency.max(1),
            exhaustion_alert_after: cfg.exhaustion_alert_after(),
            placement_order,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_config(&ReconciliationConfig::default(), PlacementOrder::default())
    }
}

// ── Reports and status ────────────────────────────────────────────

/// What one tick did to one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupTickReport {
    pub group: GroupId,
    pub desired: u32,
    /// Running + Provisioning at tick start, excluding instances marked for deletion.
    pub current: u32,
    pub allocated: u32,
    pub placed: u32,
    pub creates: u32,
    pub polls: u32,
    pub destroys: u32,
    /// Destroys issued for VMs left behind by failed instances.
    pub cleanups: u32,
    /// Failed instances whose VM is confirmed gone.
    pub cleaned: u32,
    /// Requested instances dropped before placement.
    pub dropped: u32,
    pub failed: u32,
    pub terminated: u32,
    pub exhausted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub groups: Vec<GroupTickReport>,
    /// Groups whose reconcile errored this tick.
    pub errors: Vec<(GroupId, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: GroupId,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_size: u32,
    pub current_size: u32,
    pub requested: u32,
    pub provisioning: u32,
    pub running: u32,
    pub terminating: u32,
    pub failed: u32,
    /// Failed instances still holding a host reservation.
    pub cleanup_pending: u32,
    pub marked_for_deletion: u32,
    /// Epoch seconds since which placement has been failing.
    pub capacity_exhausted_since: Option<u64>,
    /// Whether the exhaustion has outlasted the alert threshold.
    pub capacity_alert: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub ticks: u64,
    pub last_tick_at: Option<u64>,
    pub creates_total: u64,
    pub destroys_total: u64,
    pub failed_total: u64,
    /// Running instances whose VM disappeared from its host.
    pub lost_total: u64,
    pub groups: Vec<GroupStatus>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub ticks: AtomicU64,
    pub last_tick_at: AtomicU64,
    pub creates: AtomicU64,
    pub destroys: AtomicU64,
    pub failed: AtomicU64,
    pub lost: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Exhaustion {
    since: Instant,
    since_epoch: u64,
    alerted: bool,
}

// ── Actions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Create,
    Poll,
    Destroy,
    Cleanup,
}

#[derive(Debug)]
enum ActionKind {
    Create(InstanceTemplate),
    Poll(VmRef),
    Destroy(VmRef),
    /// Destroy whatever a failed instance may have left on its host.
    Cleanup(Option<VmRef>),
}

#[derive(Debug)]
struct Action {
    instance: InstanceId,
    host: HostSpec,
    kind: ActionKind,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Created { vm: VmRef, running: bool },
    Running,
    /// A created VM is no longer on its host.
    Vanished,
    Destroyed,
    Failed(GatewayError),
}

#[derive(Debug)]
struct ActionResult {
    instance: InstanceId,
    phase: Phase,
    outcome: Outcome,
}

// ── Engine ────────────────────────────────────────────────────────

/// Drives every group's observed state toward its desired size.
pub struct ReconciliationEngine {
    pub(crate) groups: Arc<GroupStore>,
    pub(crate) registry: Arc<HostRegistry>,
    pub(crate) planner: PlacementPlanner,
    pub(crate) gateway: Arc<dyn VmGateway>,
    pub(crate) config: EngineConfig,
    pub(crate) retries: Mutex<RetryBook>,
    pub(crate) in_flight: Mutex<HashSet<InstanceId>>,
    host_slots: Mutex<HashMap<HostId, Arc<Semaphore>>>,
    exhaustion: Mutex<HashMap<GroupId, Exhaustion>>,
    pub(crate) counters: Counters,
}

impl ReconciliationEngine {
    pub fn new(
        groups: Arc<GroupStore>,
        registry: Arc<HostRegistry>,
        gateway: Arc<dyn VmGateway>,
        config: EngineConfig,
    ) -> Self {
        let planner = PlacementPlanner::new(Arc::clone(&registry), config.placement_order);
        Self {
            groups,
            registry,
            planner,
            gateway,
            config,
            retries: Mutex::new(RetryBook::default()),
            in_flight: Mutex::new(HashSet::new()),
            host_slots: Mutex::new(HashMap::new()),
            exhaustion: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        &self.groups
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run ticks on the configured interval until `shutdown` flips.
    ///
    /// Only fatal errors (store invariant violations) end the loop early.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        info!(interval_ms = self.config.interval.as_millis() as u64, "reconciliation engine started");

        loop {
            match self.tick().await {
                Ok(report) => {
                    for g in &report.groups {
                        debug!(
                            group = %g.group,
                            desired = g.desired,
                            current = g.current,
                            creates = g.creates,
                            destroys = g.destroys,
                            polls = g.polls,
                            failed = g.failed,
                            "group reconciled"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %e, "reconciliation halted on fatal error");
                    return Err(e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => {
                    info!("reconciliation engine shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Reconcile every group once, concurrently.
    ///
    /// Errors local to one group are logged and reported; only fatal
    /// errors are returned.
    pub async fn tick(self: &Arc<Self>) -> EngineResult<TickReport> {
        let group_ids = self.groups.list_groups()?;
        let mut set = JoinSet::new();
        for group_id in group_ids {
            let engine = Arc::clone(self);
            set.spawn(async move {
                let result = engine.reconcile_group(&group_id).await;
                (group_id, result)
            });
        }

        let mut report = TickReport::default();
        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(group_report))) => report.groups.push(group_report),
                Ok((group, Err(e))) if e.is_fatal() => {
                    error!(%group, error = %e, "fatal reconcile error");
                    fatal.get_or_insert(e);
                }
                Ok((group, Err(e))) => {
                    error!(%group, error = %e, "group reconcile failed");
                    report.errors.push((group, e.to_string()));
                }
                Err(e) => {
                    error!(error = %e, "reconcile task aborted");
                    report.errors.push((String::new(), e.to_string()));
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        report.groups.sort_by(|a, b| a.group.cmp(&b.group));
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        self.counters.last_tick_at.store(epoch_secs(), Ordering::Relaxed);
        Ok(report)
    }

    /// One plan / execute / apply pass over a single group.
    pub async fn reconcile_group(self: &Arc<Self>, group_id: &str) -> EngineResult<GroupTickReport> {
        let mut report = GroupTickReport {
            group: group_id.to_string(),
            ..Default::default()
        };

        let actions = {
            let guard = self.groups.lock(group_id).await?;
            let snapshot = guard.snapshot()?;
            report.desired = snapshot.desired();
            report.current = snapshot.current_size();
            self.plan(&guard, &snapshot, &mut report)?
        };

        if actions.is_empty() {
            return Ok(report);
        }
        let ids: Vec<InstanceId> = actions.iter().map(|a| a.instance.clone()).collect();

        let mut set = JoinSet::new();
        for action in actions {
            let engine = Arc::clone(self);
            set.spawn(async move { engine.execute(action).await });
        }
        let mut results = Vec::with_capacity(ids.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(group = group_id, error = %e, "gateway task aborted"),
            }
        }

        let applied = match self.groups.lock(group_id).await {
            Ok(guard) => self.apply(&guard, results, &mut report),
            Err(e) => Err(e.into()),
        };
        {
            let mut in_flight = lock(&self.in_flight);
            for id in &ids {
                in_flight.remove(id);
            }
        }
        applied?;
        Ok(report)
    }

    // ── Plan ───────────────────────────────────────────────────────

    fn plan(
        &self,
        guard: &GroupGuard<'_>,
        snap: &GroupSnapshot,
        report: &mut GroupTickReport,
    ) -> EngineResult<Vec<Action>> {
        let group_id = guard.group_id();
        let now = Instant::now();
        let now_epoch = epoch_secs();
        let mut group = snap.group.clone();
        let mut batch = StateBatch::default();
        let mut actions = Vec::new();
        let mut touched: HashSet<InstanceId> = HashSet::new();
        let mut reserved: Vec<(HostId, hyperfleet_core::Resources)> = Vec::new();
        let mut released: Vec<(HostId, hyperfleet_core::Resources)> = Vec::new();
        // The group lock keeps this group's entries stable while planning.
        let mut busy: HashSet<InstanceId> = lock(&self.in_flight).clone();

        let base = group.template.clone();
        let template_for = |inst: &InstanceRecord| {
            let mut template = base.clone();
            template.resources = inst.resources;
            if let Some(net) = template.network.as_mut() {
                net.address = inst.address;
            }
            template
        };
        let range = base.static_range();
        let mut taken: HashSet<Ipv4Addr> =
            snap.instances.iter().filter_map(InstanceRecord::held_address).collect();

        // Leftovers from an interrupted apply.
        for inst in snap.instances.iter().filter(|i| i.state == InstanceState::Terminated) {
            batch.remove_instance(group_id, &inst.id);
            group.members.retain(|m| *m != inst.id);
            touched.insert(inst.id.clone());
        }

        // Scale up: reuse pending requests first, then allocate.
        let delta = i64::from(snap.desired()) - i64::from(snap.current_size());
        let pending: Vec<&InstanceRecord> = snap
            .instances
            .iter()
            .filter(|i| i.state == InstanceState::Requested)
            .collect();
        let (wanted, surplus): (Vec<&InstanceRecord>, Vec<&InstanceRecord>) = {
            let need = delta.max(0) as usize;
            let mut wanted = Vec::new();
            let mut surplus = Vec::new();
            for inst in pending {
                if !inst.marked_for_deletion && wanted.len() < need {
                    wanted.push(inst);
                } else {
                    surplus.push(inst);
                }
            }
            (wanted, surplus)
        };

        for inst in surplus {
            let mut inst = inst.clone();
            inst.transition(InstanceState::Terminated, now_epoch)?;
            batch.remove_instance(group_id, &inst.id);
            group.members.retain(|m| *m != inst.id);
            touched.insert(inst.id.clone());
            report.dropped += 1;
            debug!(group = group_id, instance = %inst.id, "pending request dropped");
        }

        let mut to_place: Vec<InstanceRecord> = wanted.into_iter().cloned().collect();
        let need = delta.max(0) as usize;
        while to_place.len() < need {
            let seq = group.next_seq;
            let id = group.allocate_instance_id();
            group.members.push(id.clone());
            to_place.push(InstanceRecord::new(
                id,
                group_id.to_string(),
                seq,
                group.template.resources,
                now_epoch,
            ));
            report.allocated += 1;
        }

        let mut exhausted = false;
        for mut inst in to_place {
            touched.insert(inst.id.clone());
            if exhausted {
                batch.put_instance(&inst);
                continue;
            }
            let address = match range {
                Some(range) => match range.first_free(|a| taken.contains(a)) {
                    Some(address) => Some(address),
                    None => {
                        exhausted = true;
                        warn!(group = group_id, instance = %inst.id, %range, "static address range exhausted");
                        batch.put_instance(&inst);
                        continue;
                    }
                },
                None => None,
            };
            match self.planner.place(group_id, &inst.resources, &group.hosts) {
                Ok(placement) => {
                    let host = match self.registry.spec(&placement.host) {
                        Ok(host) => host,
                        Err(e) => {
                            self.planner.release(&placement.host, &placement.reserved);
                            warn!(group = group_id, error = %e, "placed on unregistered host");
                            batch.put_instance(&inst);
                            continue;
                        }
                    };
                    reserved.push((placement.host.clone(), placement.reserved));
                    inst.host_id = Some(placement.host);
                    inst.address = address;
                    taken.extend(address);
                    inst.transition(InstanceState::Provisioning, now_epoch)?;
                    batch.put_instance(&inst);
                    busy.insert(inst.id.clone());
                    actions.push(Action {
                        instance: inst.id.clone(),
                        host,
                        kind: ActionKind::Create(template_for(&inst)),
                    });
                    report.placed += 1;
                    report.creates += 1;
                }
                Err(PlacementError::CapacityExhausted { considered, .. }) => {
                    exhausted = true;
                    debug!(group = group_id, instance = %inst.id, considered, "no host has capacity");
                    batch.put_instance(&inst);
                }
            }
        }
        report.exhausted = exhausted;

        // Explicitly deleted instances go before any oldest-first victim.
        let mut terminate: Vec<&InstanceRecord> = snap
            .instances
            .iter()
            .filter(|i| {
                i.marked_for_deletion
                    && !touched.contains(&i.id)
                    && !busy.contains(&i.id)
                    && (i.state == InstanceState::Running
                        || (i.state == InstanceState::Provisioning && i.vm_ref.is_some()))
            })
            .collect();

        if delta < 0 {
            let victims = snap
                .instances
                .iter()
                .filter(|i| {
                    i.state == InstanceState::Running
                        && !i.marked_for_deletion
                        && !busy.contains(&i.id)
                })
                .take(delta.unsigned_abs() as usize);
            terminate.extend(victims);
        }

        for inst in terminate {
            let mut inst = inst.clone();
            let (Some(host_id), Some(vm)) = (inst.host_id.clone(), inst.vm_ref.clone()) else {
                continue;
            };
            let Ok(host) = self.registry.spec(&host_id) else {
                warn!(group = group_id, instance = %inst.id, host = %host_id, "instance on unknown host");
                continue;
            };
            inst.transition(InstanceState::Terminating, now_epoch)?;
            batch.put_instance(&inst);
            touched.insert(inst.id.clone());
            busy.insert(inst.id.clone());
            info!(group = group_id, instance = %inst.id, host = %host_id, marked = inst.marked_for_deletion, "terminating instance");
            actions.push(Action {
                instance: inst.id,
                host,
                kind: ActionKind::Destroy(vm),
            });
            report.destroys += 1;
        }

        // Everything still mid-lifecycle from the snapshot.
        for inst in &snap.instances {
            if touched.contains(&inst.id) || busy.contains(&inst.id) {
                continue;
            }
            let cleanup = inst.state == InstanceState::Failed && inst.cleanup_pending;
            if !cleanup && !matches!(inst.state, InstanceState::Provisioning | InstanceState::Terminating) {
                continue;
            }
            if !lock(&self.retries).is_due(&inst.id, now) {
                continue;
            }
            let Some(host_id) = inst.host_id.as_deref() else {
                warn!(group = group_id, instance = %inst.id, state = inst.state.as_str(), "in-flight instance has no host");
                continue;
            };

            let kind = match (inst.state, inst.vm_ref.clone()) {
                (InstanceState::Provisioning, None) => ActionKind::Create(template_for(inst)),
                (InstanceState::Provisioning, Some(vm)) => ActionKind::Poll(vm),
                (InstanceState::Terminating, Some(vm)) => ActionKind::Destroy(vm),
                (InstanceState::Terminating, None) => {
                    let mut inst = inst.clone();
                    inst.transition(InstanceState::Terminated, now_epoch)?;
                    released.push((host_id.to_string(), inst.resources));
                    batch.remove_instance(group_id, &inst.id);
                    group.members.retain(|m| *m != inst.id);
                    report.terminated += 1;
                    continue;
                }
                (InstanceState::Failed, vm) => ActionKind::Cleanup(vm),
                _ => continue,
            };
            let Ok(host) = self.registry.spec(host_id) else {
                warn!(group = group_id, instance = %inst.id, host = host_id, "instance on unknown host");
                continue;
            };
            match &kind {
                ActionKind::Create(_) => report.creates += 1,
                ActionKind::Poll(_) => report.polls += 1,
                ActionKind::Destroy(_) => report.destroys += 1,
                ActionKind::Cleanup(_) => report.cleanups += 1,
            }
            busy.insert(inst.id.clone());
            actions.push(Action {
                instance: inst.id.clone(),
                host,
                kind,
            });
        }

        if group.members != snap.group.members || group.next_seq != snap.group.next_seq {
            group.updated_at = now_epoch;
            batch.put_group(&group);
        }

        if let Err(e) = guard.commit(batch) {
            for (host, res) in &reserved {
                self.planner.release(host, res);
            }
            return Err(e.into());
        }
        for (host, res) in &released {
            self.planner.release(host, res);
        }
        lock(&self.in_flight).extend(actions.iter().map(|a| a.instance.clone()));

        self.note_exhaustion(group_id, exhausted);
        Ok(actions)
    }

    fn note_exhaustion(&self, group_id: &str, exhausted: bool) {
        let mut map = lock(&self.exhaustion);
        if !exhausted {
            if let Some(prev) = map.remove(group_id)
                && prev.alerted
            {
                info!(group = group_id, "capacity available again");
            }
            return;
        }
        let entry = map.entry(group_id.to_string()).or_insert_with(|| {
            warn!(group = group_id, "capacity exhausted; pending instances stay requested");
            Exhaustion {
                since: Instant::now(),
                since_epoch: epoch_secs(),
                alerted: false,
            }
        });
        if !entry.alerted && entry.since.elapsed() >= self.config.exhaustion_alert_after {
            entry.alerted = true;
            error!(
                group = group_id,
                since = entry.since_epoch,
                "capacity exhausted beyond alert threshold"
            );
        }
    }

    // ── Execute ────────────────────────────────────────────────────

    fn host_slot(&self, host: &str) -> Arc<Semaphore> {
        let mut slots = lock(&self.host_slots);
        Arc::clone(
            slots
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.host_concurrency))),
        )
    }

    /// Run one gateway call under the host's concurrency cap and the call timeout.
    pub(crate) async fn call<T>(
        &self,
        host: &str,
        fut: impl Future<Output = GatewayResult<T>>,
    ) -> GatewayResult<T> {
        let slot = self.host_slot(host);
        let _permit = slot.acquire_owned().await.ok();
        let limit = self.config.gateway_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(GatewayError::Timeout(limit)))
    }

    async fn execute(&self, action: Action) -> ActionResult {
        let Action {
            instance,
            host,
            kind,
        } = action;
        let gw = &self.gateway;

        let (phase, outcome) = match kind {
            ActionKind::Create(template) => {
                let outcome = match self
                    .call(&host.name, gw.create(&host, &instance, &template))
                    .await
                {
                    Ok(vm) => {
                        let running = matches!(
                            self.call(&host.name, gw.status(&host, &vm)).await,
                            Ok(VmStatus::Running)
                        );
                        Outcome::Created { vm, running }
                    }
                    Err(e) => Outcome::Failed(e),
                };
                (Phase::Create, outcome)
            }
            ActionKind::Poll(vm) => {
                let outcome = match self.call(&host.name, gw.status(&host, &vm)).await {
                    Ok(VmStatus::Running) => Outcome::Running,
                    Ok(VmStatus::Absent) => Outcome::Vanished,
                    Err(e) => Outcome::Failed(e),
                };
                (Phase::Poll, outcome)
            }
            ActionKind::Destroy(vm) => {
                let outcome = match self.call(&host.name, gw.destroy(&host, &vm)).await {
                    Ok(()) => Outcome::Destroyed,
                    Err(e) => Outcome::Failed(e),
                };
                (Phase::Destroy, outcome)
            }
            ActionKind::Cleanup(vm) => {
                let vm = vm.unwrap_or_else(|| gw.vm_ref(&host, &instance));
                let outcome = match self.call(&host.name, gw.destroy(&host, &vm)).await {
                    Ok(()) => Outcome::Destroyed,
                    Err(e) => Outcome::Failed(e),
                };
                (Phase::Cleanup, outcome)
            }
        };

        ActionResult {
            instance,
            phase,
            outcome,
        }
    }

    // ── Apply ──────────────────────────────────────────────────────

    fn apply(
        &self,
        guard: &GroupGuard<'_>,
        results: Vec<ActionResult>,
        report: &mut GroupTickReport,
    ) -> EngineResult<()> {
        let group_id = guard.group_id();
        let mut group = guard.record()?;
        let members_before = group.members.clone();
        let mut batch = StateBatch::default();
        let mut released: Vec<(HostId, hyperfleet_core::Resources)> = Vec::new();
        let now = Instant::now();
        let now_epoch = epoch_secs();

        for result in results {
            let Some(mut inst) = guard.instance(&result.instance)? else {
                continue;
            };
            let host = inst.host_id.clone().unwrap_or_default();
            let mut retries = lock(&self.retries);

            match result.outcome {
                Outcome::Created { vm, running } => {
                    self.counters.creates.fetch_add(1, Ordering::Relaxed);
                    retries.clear(&inst.id);
                    inst.retry_count = 0;
                    inst.last_error = None;
                    inst.vm_ref = Some(vm.clone());
                    inst.updated_at = now_epoch;
                    if running && inst.state == InstanceState::Provisioning {
                        inst.transition(InstanceState::Running, now_epoch)?;
                        info!(group = group_id, instance = %inst.id, %host, %vm, "instance running");
                    } else {
                        debug!(group = group_id, instance = %inst.id, %host, %vm, "vm created; waiting for it to run");
                    }
                }
                Outcome::Running => {
                    retries.clear(&inst.id);
                    inst.retry_count = 0;
                    inst.last_error = None;
                    if inst.state == InstanceState::Provisioning {
                        inst.transition(InstanceState::Running, now_epoch)?;
                        info!(group = group_id, instance = %inst.id, %host, "instance running");
                    }
                }
                Outcome::Destroyed if inst.state == InstanceState::Failed => {
                    self.counters.destroys.fetch_add(1, Ordering::Relaxed);
                    retries.clear(&inst.id);
                    if inst.cleanup_pending {
                        inst.cleanup_pending = false;
                        inst.vm_ref = None;
                        inst.address = None;
                        inst.updated_at = now_epoch;
                        released.push((host.clone(), inst.resources));
                        report.cleaned += 1;
                        info!(group = group_id, instance = %inst.id, %host, "vm of failed instance destroyed; capacity released");
                    }
                }
                Outcome::Destroyed => {
                    self.counters.destroys.fetch_add(1, Ordering::Relaxed);
                    retries.clear(&inst.id);
                    if inst.state == InstanceState::Terminating {
                        inst.transition(InstanceState::Terminated, now_epoch)?;
                    }
                    released.push((host.clone(), inst.resources));
                    batch.remove_instance(group_id, &inst.id);
                    group.members.retain(|m| *m != inst.id);
                    report.terminated += 1;
                    info!(group = group_id, instance = %inst.id, %host, "instance terminated");
                    continue;
                }
                Outcome::Vanished => {
                    inst.vm_ref = None;
                    let err = GatewayError::Protocol("vm absent after create".into());
                    if self.record_failure(&mut retries, &mut inst, result.phase, &err, now, now_epoch)? {
                        report.failed += 1;
                    }
                }
                Outcome::Failed(err) => {
                    if self.record_failure(&mut retries, &mut inst, result.phase, &err, now, now_epoch)? {
                        report.failed += 1;
                    }
                }
            }
            batch.put_instance(&inst);
        }

        if group.members != members_before {
            group.updated_at = now_epoch;
            batch.put_group(&group);
        }
        guard.commit(batch)?;

        for (host, res) in &released {
            self.planner.release(host, res);
        }
        Ok(())
    }

    /// Count a failed action against the instance. Returns true when the
    /// instance has just moved to `Failed`, still holding its reservation.
    fn record_failure(
        &self,
        retries: &mut RetryBook,
        inst: &mut InstanceRecord,
        phase: Phase,
        err: &GatewayError,
        now: Instant,
        now_epoch: u64,
    ) -> EngineResult<bool> {
        let policy = &self.config.retry;
        let state = retries.record_failure(&inst.id, policy, now);
        inst.retry_count = state.failures;
        inst.last_error = Some(err.to_string());
        inst.updated_at = now_epoch;
        let host = inst.host_id.clone().unwrap_or_default();

        if matches!(phase, Phase::Destroy | Phase::Cleanup) {
            if state.failures == policy.max_retries {
                error!(group = %inst.group_id, instance = %inst.id, %host, attempts = state.failures, error = %err, "destroy still failing past retry ceiling");
            } else {
                warn!(group = %inst.group_id, instance = %inst.id, %host, attempts = state.failures, error = %err, "destroy failed; will retry");
            }
            return Ok(false);
        }

        if !policy.exhausted(state.failures) {
            warn!(
                group = %inst.group_id,
                instance = %inst.id,
                %host,
                attempts = state.failures,
                retry_in_ms = policy.backoff(state.failures).as_millis() as u64,
                error = %err,
                "lifecycle action failed; will retry"
            );
            return Ok(false);
        }

        inst.transition(InstanceState::Failed, now_epoch)?;
        inst.cleanup_pending = inst.host_id.is_some();
        retries.clear(&inst.id);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            group = %inst.group_id,
            instance = %inst.id,
            %host,
            attempts = state.failures,
            error = %err,
            "instance failed; retries exhausted, a replacement will be created"
        );
        Ok(true)
    }

    // ── Status ─────────────────────────────────────────────────────

    pub fn status(&self) -> EngineResult<EngineStatus> {
        let exhaustion = lock(&self.exhaustion).clone();
        let mut groups = Vec::new();
        for group_id in self.groups.list_groups()? {
            let group = self.groups.get(&group_id)?;
            let instances = self.groups.instances(&group_id)?;
            let count = |s: InstanceState| instances.iter().filter(|i| i.state == s).count() as u32;
            let ex = exhaustion.get(&group_id);
            groups.push(GroupStatus {
                min_size: group.min_size,
                max_size: group.max_size,
                desired_size: group.desired_size,
                current_size: instances
                    .iter()
                    .filter(|i| i.state.counts_toward_size() && !i.marked_for_deletion)
                    .count() as u32,
                requested: count(InstanceState::Requested),
                provisioning: count(InstanceState::Provisioning),
                running: count(InstanceState::Running),
                terminating: count(InstanceState::Terminating),
                failed: count(InstanceState::Failed),
                cleanup_pending: instances.iter().filter(|i| i.cleanup_pending).count() as u32,
                marked_for_deletion: instances.iter().filter(|i| i.marked_for_deletion).count() as u32,
                capacity_exhausted_since: ex.map(|e| e.since_epoch),
                capacity_alert: ex.is_some_and(|e| e.alerted),
                group: group_id,
            });
        }

        let last = self.counters.last_tick_at.load(Ordering::Relaxed);
        Ok(EngineStatus {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            last_tick_at: (last > 0).then_some(last),
            creates_total: self.counters.creates.load(Ordering::Relaxed),
            destroys_total: self.counters.destroys.load(Ordering::Relaxed),
            failed_total: self.counters.failed.load(Ordering::Relaxed),
            lost_total: self.counters.lost.load(Ordering::Relaxed),
            groups,
        })
    }
}

impl EngineError {
    /// Whether the error means persisted state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::State(StateError::Corrupt(_) | StateError::InvalidTransition { .. })
                | EngineError::Group(GroupError::State(
                    StateError::Corrupt(_) | StateError::InvalidTransition { .. }
                ))
        )
    }
}
