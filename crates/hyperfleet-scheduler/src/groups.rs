//! Autoscaling group store.
//!
//! Wraps the [`StateStore`] with per-group serialization. Every mutation
//! of a group (desired size, membership, instance records) happens while
//! holding that group's lock, obtained through [`GroupStore::lock`]. The
//! reconciliation engine takes the same lock while it computes a tick's
//! plan and while it applies gateway results, so an orchestrator request
//! never interleaves with a scale-down selection.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use hyperfleet_core::{
    ConfigError, ControllerConfig, GroupId, HostId, InstanceId, InstanceTemplate, epoch_secs,
};
use hyperfleet_core::config::GroupConfig;
use hyperfleet_state::{
    GroupRecord, InstanceRecord, InstanceState, RequestKind, RequestRecord, StateBatch,
    StateStore,
};

use crate::error::{GroupError, GroupResult};

/// Operator-declared shape of a group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDefinition {
    pub id: GroupId,
    pub template: InstanceTemplate,
    pub min_size: u32,
    pub max_size: u32,
    /// Initial desired size; only used when the group is first created.
    pub desired_size: u32,
    pub hosts: Vec<HostId>,
}

impl GroupDefinition {
    pub fn from_config(id: &str, cfg: &GroupConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            id: id.to_string(),
            template: cfg.template(id)?,
            min_size: cfg.scaling.min,
            max_size: cfg.scaling.max,
            desired_size: cfg.scaling.desired,
            hosts: cfg.hosts.clone(),
        })
    }

    /// Every group declared in `config`.
    pub fn all(config: &ControllerConfig) -> Result<Vec<Self>, ConfigError> {
        config
            .groups
            .iter()
            .map(|(id, cfg)| Self::from_config(id, cfg))
            .collect()
    }
}

/// Outcome of [`GroupStore::sync`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<GroupId>,
    pub updated: Vec<GroupId>,
    /// Persisted groups no longer present in config. Left untouched.
    pub orphaned: Vec<GroupId>,
}

/// Consistent view of one group and its instances.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub group: GroupRecord,
    /// Instance records ordered oldest first.
    pub instances: Vec<InstanceRecord>,
}

impl GroupSnapshot {
    pub fn desired(&self) -> u32 {
        self.group.desired_size
    }

    pub fn members(&self) -> &[InstanceId] {
        &self.group.members
    }

    pub fn count(&self, state: InstanceState) -> usize {
        self.instances.iter().filter(|i| i.state == state).count()
    }

    /// Running + Provisioning instances not already marked for deletion.
    pub fn current_size(&self) -> u32 {
        self.instances
            .iter()
            .filter(|i| i.state.counts_toward_size() && !i.marked_for_deletion)
            .count() as u32
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.id == id)
    }
}

/// Exclusive access to one group until dropped.
pub struct GroupGuard<'a> {
    store: &'a GroupStore,
    group_id: GroupId,
    _lock: OwnedMutexGuard<()>,
}

impl GroupGuard<'_> {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn record(&self) -> GroupResult<GroupRecord> {
        self.store.get(&self.group_id)
    }

    pub fn snapshot(&self) -> GroupResult<GroupSnapshot> {
        let group = self.record()?;
        let mut instances = self.store.state.list_instances_for_group(&self.group_id)?;
        instances.sort_by_key(|i| i.seq);
        Ok(GroupSnapshot { group, instances })
    }

    pub fn instance(&self, instance_id: &str) -> GroupResult<Option<InstanceRecord>> {
        Ok(self.store.state.get_instance(&self.group_id, instance_id)?)
    }

    /// Commit a batch of changes for this group atomically.
    pub fn commit(&self, batch: StateBatch) -> GroupResult<()> {
        Ok(self.store.state.commit(batch)?)
    }
}

/// Group definitions, desired sizes and membership.
pub struct GroupStore {
    state: StateStore,
    locks: Mutex<HashMap<GroupId, Arc<AsyncMutex<()>>>>,
}

impl GroupStore {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Acquire the per-group lock. Fails if the group does not exist.
    pub async fn lock(&self, group_id: &str) -> GroupResult<GroupGuard<'_>> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(group_id.to_string()).or_default())
        };
        let lock = mutex.lock_owned().await;
        // Existence is checked under the lock so it cannot race `sync`.
        if self.state.get_group(group_id)?.is_none() {
            return Err(GroupError::NotFound(group_id.to_string()));
        }
        Ok(GroupGuard {
            store: self,
            group_id: group_id.to_string(),
            _lock: lock,
        })
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn list_groups(&self) -> GroupResult<Vec<GroupId>> {
        Ok(self
            .state
            .list_groups()?
            .into_iter()
            .map(|g| g.id)
            .collect())
    }

    pub fn get(&self, group_id: &str) -> GroupResult<GroupRecord> {
        self.state
            .get_group(group_id)?
            .ok_or_else(|| GroupError::NotFound(group_id.to_string()))
    }

    pub fn target_size(&self, group_id: &str) -> GroupResult<u32> {
        Ok(self.get(group_id)?.desired_size)
    }

    /// Instance records of a group, oldest first.
    pub fn instances(&self, group_id: &str) -> GroupResult<Vec<InstanceRecord>> {
        self.get(group_id)?;
        let mut instances = self.state.list_instances_for_group(group_id)?;
        instances.sort_by_key(|i| i.seq);
        Ok(instances)
    }

    pub async fn snapshot(&self, group_id: &str) -> GroupResult<GroupSnapshot> {
        self.lock(group_id).await?.snapshot()
    }

    // ── Desired size ───────────────────────────────────────────────

    /// Set the desired size, clamped into `[min, max]`.
    ///
    /// Returns the applied size. A request outside the range is still
    /// applied (clamped) and reported as [`GroupError::OutOfRange`].
    pub async fn set_desired_size(&self, group_id: &str, n: u32) -> GroupResult<u32> {
        let guard = self.lock(group_id).await?;
        let mut group = guard.record()?;
        let applied = group.clamp_size(n);

        if applied != group.desired_size {
            info!(group = group_id, from = group.desired_size, to = applied, "desired size changed");
            group.desired_size = applied;
            group.updated_at = epoch_secs();
            self.state.put_group(&group)?;
        }

        if applied != n {
            return Err(GroupError::OutOfRange {
                group: group_id.to_string(),
                requested: n,
                applied,
                min: group.min_size,
                max: group.max_size,
            });
        }
        Ok(applied)
    }

    /// Add `delta` to the desired size.
    ///
    /// With a `request_id`, a repeated delivery returns the size recorded
    /// for the first one and changes nothing. With `expected`, the call
    /// fails unless the current desired size equals it.
    pub async fn increase_size(
        &self,
        group_id: &str,
        delta: u32,
        request_id: Option<&str>,
        expected: Option<u32>,
    ) -> GroupResult<u32> {
        let guard = self.lock(group_id).await?;

        if let Some(request_id) = request_id
            && let Some(size) = self.replay(group_id, request_id, RequestKind::Increase)?
        {
            return Ok(size);
        }

        let mut group = guard.record()?;
        if delta == 0 {
            return Err(GroupError::InvalidDelta {
                group: group_id.to_string(),
            });
        }
        if let Some(expected) = expected
            && expected != group.desired_size
        {
            return Err(GroupError::PreconditionFailed {
                group: group_id.to_string(),
                expected,
                actual: group.desired_size,
            });
        }

        let requested = u64::from(group.desired_size) + u64::from(delta);
        if requested > u64::from(group.max_size) {
            return Err(GroupError::ExceedsMax {
                group: group_id.to_string(),
                delta,
                requested,
                max: group.max_size,
            });
        }

        let now = epoch_secs();
        let previous = group.desired_size;
        group.desired_size = requested as u32;
        group.updated_at = now;

        let mut batch = StateBatch::default();
        batch.put_group(&group);
        if let Some(request_id) = request_id {
            batch.put_request(&RequestRecord {
                group_id: group_id.to_string(),
                request_id: request_id.to_string(),
                kind: RequestKind::Increase,
                delta,
                resulting_size: group.desired_size,
                recorded_at: now,
            });
        }
        guard.commit(batch)?;

        info!(group = group_id, from = previous, to = group.desired_size, request_id, "group increased");
        Ok(group.desired_size)
    }

    /// Mark specific instances for termination and shrink the group by the
    /// number newly marked.
    ///
    /// Every ID must belong to the group, or nothing changes. Instances
    /// already marked, terminating or terminated are accepted and not
    /// counted twice. Failed instances whose VM is confirmed gone are
    /// reaped on the spot; they were never counted toward the size. With a
    /// `request_id`, a repeated delivery returns the size recorded for the
    /// first one, even after the instances have been reaped.
    pub async fn delete_instances(
        &self,
        group_id: &str,
        instance_ids: &[InstanceId],
        request_id: Option<&str>,
    ) -> GroupResult<u32> {
        let guard = self.lock(group_id).await?;

        if let Some(request_id) = request_id
            && let Some(size) = self.replay(group_id, request_id, RequestKind::Delete)?
        {
            return Ok(size);
        }

        let snapshot = guard.snapshot()?;

        let ids: BTreeSet<&str> = instance_ids.iter().map(String::as_str).collect();
        let mut targets = Vec::with_capacity(ids.len());
        for id in &ids {
            match snapshot.instance(id) {
                Some(inst) if snapshot.group.is_member(id) => targets.push(inst.clone()),
                _ => {
                    return Err(GroupError::NotMember {
                        group: group_id.to_string(),
                        instance: id.to_string(),
                    });
                }
            }
        }

        let counted = |i: &InstanceRecord| {
            !i.marked_for_deletion
                && matches!(
                    i.state,
                    InstanceState::Requested | InstanceState::Provisioning | InstanceState::Running
                )
        };
        let newly_marked = targets.iter().filter(|&i| counted(i)).count() as u32;

        let mut group = snapshot.group.clone();
        if group.desired_size < newly_marked
            || group.desired_size - newly_marked < group.min_size
        {
            return Err(GroupError::BelowMin {
                group: group_id.to_string(),
                count: newly_marked,
                min: group.min_size,
            });
        }

        let now = epoch_secs();
        let mut batch = StateBatch::default();
        for mut inst in targets {
            if counted(&inst) {
                inst.marked_for_deletion = true;
                inst.updated_at = now;
                batch.put_instance(&inst);
            } else if inst.state == InstanceState::Failed && !inst.cleanup_pending {
                group.members.retain(|m| *m != inst.id);
                batch.remove_instance(group_id, &inst.id);
            }
        }
        group.desired_size -= newly_marked;
        group.updated_at = now;
        batch.put_group(&group);
        if let Some(request_id) = request_id {
            batch.put_request(&RequestRecord {
                group_id: group_id.to_string(),
                request_id: request_id.to_string(),
                kind: RequestKind::Delete,
                delta: newly_marked,
                resulting_size: group.desired_size,
                recorded_at: now,
            });
        }
        guard.commit(batch)?;

        info!(
            group = group_id,
            marked = newly_marked,
            desired = group.desired_size,
            "instances marked for deletion"
        );
        Ok(group.desired_size)
    }

    /// Size recorded for an earlier delivery of `request_id`, if any.
    /// Caller holds the group lock.
    fn replay(
        &self,
        group_id: &str,
        request_id: &str,
        kind: RequestKind,
    ) -> GroupResult<Option<u32>> {
        let Some(prior) = self.state.get_request(group_id, request_id)? else {
            return Ok(None);
        };
        if prior.kind != kind {
            return Err(GroupError::RequestConflict {
                group: group_id.to_string(),
                request_id: request_id.to_string(),
            });
        }
        debug!(group = group_id, request_id, ?kind, size = prior.resulting_size, "duplicate request");
        Ok(Some(prior.resulting_size))
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Persist a new instance record and append it to the member list.
    pub async fn add_member(&self, group_id: &str, instance: &InstanceRecord) -> GroupResult<()> {
        let guard = self.lock(group_id).await?;
        let mut group = guard.record()?;
        if !group.is_member(&instance.id) {
            group.members.push(instance.id.clone());
        }
        group.next_seq = group.next_seq.max(instance.seq + 1);
        group.updated_at = epoch_secs();

        let mut batch = StateBatch::default();
        batch.put_instance(instance).put_group(&group);
        guard.commit(batch)
    }

    /// Drop an instance record and its membership. Returns whether it was a member.
    pub async fn remove_member(&self, group_id: &str, instance_id: &str) -> GroupResult<bool> {
        let guard = self.lock(group_id).await?;
        let mut group = guard.record()?;
        let was_member = group.is_member(instance_id);
        group.members.retain(|m| m != instance_id);
        group.updated_at = epoch_secs();

        let mut batch = StateBatch::default();
        batch.remove_instance(group_id, instance_id).put_group(&group);
        guard.commit(batch)?;
        Ok(was_member)
    }

    /// Remove every Failed instance of the group whose VM is confirmed
    /// gone. Returns the reaped IDs; instances still awaiting cleanup stay.
    pub async fn reap_failed(&self, group_id: &str) -> GroupResult<Vec<InstanceId>> {
        let guard = self.lock(group_id).await?;
        let snapshot = guard.snapshot()?;
        let failed: Vec<InstanceId> = snapshot
            .instances
            .iter()
            .filter(|i| i.state == InstanceState::Failed && !i.cleanup_pending)
            .map(|i| i.id.clone())
            .collect();
        if failed.is_empty() {
            return Ok(failed);
        }

        let mut group = snapshot.group;
        group.members.retain(|m| !failed.contains(m));
        group.updated_at = epoch_secs();
        let mut batch = StateBatch::default();
        for id in &failed {
            batch.remove_instance(group_id, id);
        }
        batch.put_group(&group);
        guard.commit(batch)?;

        info!(group = group_id, count = failed.len(), "failed instances reaped");
        Ok(failed)
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Bring persisted groups in line with operator config.
    ///
    /// New groups start at their configured desired size. Existing groups
    /// take the configured template, bounds and host pool but keep their
    /// persisted desired size (re-clamped into the new bounds).
    pub async fn sync(&self, definitions: &[GroupDefinition]) -> GroupResult<SyncReport> {
        let mut report = SyncReport::default();
        let now = epoch_secs();

        for def in definitions {
            let mutex = {
                let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
                Arc::clone(locks.entry(def.id.clone()).or_default())
            };
            let _lock = mutex.lock_owned().await;

            match self.state.get_group(&def.id)? {
                None => {
                    let desired = def.desired_size.clamp(def.min_size, def.max_size);
                    self.state.put_group(&GroupRecord {
                        id: def.id.clone(),
                        template: def.template.clone(),
                        min_size: def.min_size,
                        max_size: def.max_size,
                        desired_size: desired,
                        hosts: def.hosts.clone(),
                        members: Vec::new(),
                        next_seq: 0,
                        created_at: now,
                        updated_at: now,
                    })?;
                    info!(group = %def.id, desired, min = def.min_size, max = def.max_size, "group created");
                    report.created.push(def.id.clone());
                }
                Some(mut group) => {
                    let before = group.clone();
                    group.template = def.template.clone();
                    group.min_size = def.min_size;
                    group.max_size = def.max_size;
                    group.hosts = def.hosts.clone();
                    group.desired_size = group.clamp_size(group.desired_size);
                    if group != before {
                        if group.desired_size != before.desired_size {
                            warn!(
                                group = %def.id,
                                from = before.desired_size,
                                to = group.desired_size,
                                "desired size re-clamped to new bounds"
                            );
                        }
                        group.updated_at = now;
                        self.state.put_group(&group)?;
                        info!(group = %def.id, "group definition updated");
                        report.updated.push(def.id.clone());
                    }
                }
            }
        }

        for group in self.state.list_groups()? {
            if !definitions.iter().any(|d| d.id == group.id) {
                warn!(group = %group.id, "persisted group missing from config; leaving it untouched");
                report.orphaned.push(group.id);
            }
        }
        Ok(report)
    }
}
