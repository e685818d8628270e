//! Startup recovery.
//!
//! Runs once before the first tick. Rebuilds host capacity accounting
//! from persisted instances, repairs membership lists, and polls every
//! instance that has a VM reference so that the first tick works from
//! what the hosts actually report.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use hyperfleet_core::{GatewayResult, HostId, InstanceId, Resources, VmRef, VmStatus, epoch_secs};
use hyperfleet_state::{InstanceState, StateBatch, StateError};

use crate::engine::{ReconciliationEngine, lock};
use crate::error::EngineResult;
use crate::retry::RetryBook;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Instances whose capacity was re-reserved on their host.
    pub reserved: u32,
    pub confirmed: u32,
    /// Running instances whose VM was gone.
    pub lost: u32,
    pub terminated: u32,
    /// Provisioning instances whose create will be re-issued.
    pub recreate: u32,
    /// Instances whose status could not be read; left untouched.
    pub unknown: u32,
    /// Membership entries added or dropped to match instance records.
    pub repaired: u32,
}

struct Probe {
    instance: InstanceId,
    result: GatewayResult<VmStatus>,
}

impl ReconciliationEngine {
    /// Reconcile persisted state with the hosts after a restart.
    ///
    /// Fails only when persisted state is inconsistent in a way no tick
    /// could repair, such as two instances holding the same VM.
    pub async fn recover(self: &Arc<Self>) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let group_ids = self.groups.list_groups()?;

        let mut seen: HashSet<(HostId, VmRef)> = HashSet::new();
        for inst in self.groups.state().list_instances()? {
            if let (Some(host), Some(vm)) = (inst.host_id.clone(), inst.vm_ref.clone())
                && inst.state != InstanceState::Terminated
                && !seen.insert((host.clone(), vm.clone()))
            {
                return Err(StateError::Corrupt(format!(
                    "vm {vm} on {host} is held by more than one instance"
                ))
                .into());
            }
        }

        *lock(&self.retries) = RetryBook::default();

        for group_id in group_ids {
            self.recover_group(&group_id, &mut report).await?;
        }

        info!(
            reserved = report.reserved,
            confirmed = report.confirmed,
            lost = report.lost,
            terminated = report.terminated,
            recreate = report.recreate,
            unknown = report.unknown,
            repaired = report.repaired,
            "recovery complete"
        );
        Ok(report)
    }

    async fn recover_group(
        self: &Arc<Self>,
        group_id: &str,
        report: &mut RecoveryReport,
    ) -> EngineResult<()> {
        let now = epoch_secs();
        let mut probes = JoinSet::new();

        {
            let guard = self.groups.lock(group_id).await?;
            let mut group = guard.record()?;
            let instances = self.groups.instances(group_id)?;
            let mut batch = StateBatch::default();

            let known: HashSet<&str> = instances.iter().map(|i| i.id.as_str()).collect();
            let before = group.members.len();
            group.members.retain(|m| {
                let keep = known.contains(m.as_str());
                if !keep {
                    warn!(group = group_id, instance = %m, "member has no instance record; dropping");
                }
                keep
            });
            let mut repaired = (before - group.members.len()) as u32;

            for inst in &instances {
                if inst.state == InstanceState::Terminated {
                    batch.remove_instance(group_id, &inst.id);
                    group.members.retain(|m| *m != inst.id);
                    continue;
                }
                if !group.is_member(&inst.id) {
                    warn!(group = group_id, instance = %inst.id, "instance record missing from members; re-adding");
                    group.members.push(inst.id.clone());
                    repaired += 1;
                }
                group.next_seq = group.next_seq.max(inst.seq + 1);

                if inst.retry_count > 0 {
                    let mut inst = inst.clone();
                    inst.retry_count = 0;
                    batch.put_instance(&inst);
                }

                let Some(host_id) = inst.host_id.as_deref().filter(|_| inst.holds_capacity()) else {
                    continue;
                };
                let host = match self.registry.spec(host_id) {
                    Ok(host) => host,
                    Err(e) => {
                        warn!(group = group_id, instance = %inst.id, host = host_id, error = %e, "instance on unknown host");
                        continue;
                    }
                };
                if self.registry.force_reserve(host_id, &inst.resources).is_ok() {
                    report.reserved += 1;
                }

                // Failed instances are cleaned up by the tick, not polled here.
                if let Some(vm) = inst.vm_ref.clone().filter(|_| inst.state != InstanceState::Failed) {
                    let engine = Arc::clone(self);
                    let instance = inst.id.clone();
                    probes.spawn(async move {
                        let result = engine.call(&host.name, engine.gateway.status(&host, &vm)).await;
                        Probe { instance, result }
                    });
                }
            }

            // Keep members in allocation order.
            let seq_of: HashMap<&str, u64> =
                instances.iter().map(|i| (i.id.as_str(), i.seq)).collect();
            group
                .members
                .sort_by_key(|m| seq_of.get(m.as_str()).copied().unwrap_or(u64::MAX));

            report.repaired += repaired;
            group.updated_at = now;
            batch.put_group(&group);
            guard.commit(batch)?;
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(probe) => results.push(probe),
                Err(e) => warn!(group = group_id, error = %e, "status probe aborted"),
            }
        }
        if results.is_empty() {
            return Ok(());
        }

        let guard = self.groups.lock(group_id).await?;
        let mut group = guard.record()?;
        let mut batch = StateBatch::default();
        let mut released: Vec<(HostId, Resources)> = Vec::new();

        for probe in results {
            let Some(mut inst) = guard.instance(&probe.instance)? else {
                continue;
            };
            let host = inst.host_id.clone().unwrap_or_default();
            match (probe.result, inst.state) {
                (Ok(VmStatus::Running), InstanceState::Provisioning) => {
                    inst.transition(InstanceState::Running, now)?;
                    report.confirmed += 1;
                }
                (Ok(VmStatus::Running), _) => {
                    report.confirmed += 1;
                    continue;
                }
                (Ok(VmStatus::Absent), InstanceState::Terminating) => {
                    inst.transition(InstanceState::Terminated, now)?;
                    released.push((host, inst.resources));
                    batch.remove_instance(group_id, &inst.id);
                    group.members.retain(|m| *m != inst.id);
                    report.terminated += 1;
                    continue;
                }
                (Ok(VmStatus::Absent), InstanceState::Running) => {
                    warn!(group = group_id, instance = %inst.id, %host, "vm vanished while controller was down; will be replaced");
                    inst.transition(InstanceState::Terminated, now)?;
                    released.push((host, inst.resources));
                    batch.remove_instance(group_id, &inst.id);
                    group.members.retain(|m| *m != inst.id);
                    self.counters.lost.fetch_add(1, Ordering::Relaxed);
                    report.lost += 1;
                    continue;
                }
                (Ok(VmStatus::Absent), InstanceState::Provisioning) => {
                    inst.vm_ref = None;
                    inst.updated_at = now;
                    report.recreate += 1;
                }
                (Ok(VmStatus::Absent), _) => continue,
                (Err(e), _) => {
                    warn!(group = group_id, instance = %inst.id, %host, error = %e, "status unknown after restart; leaving as is");
                    report.unknown += 1;
                    continue;
                }
            }
            batch.put_instance(&inst);
        }

        group.updated_at = now;
        batch.put_group(&group);
        guard.commit(batch)?;
        for (host, res) in &released {
            self.planner.release(host, res);
        }
        Ok(())
    }
}
