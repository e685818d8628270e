//! Persisted records for groups, instances and orchestrator requests.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use hyperfleet_core::{GroupId, HostId, InstanceId, InstanceTemplate, Resources, VmRef};

use crate::error::{StateError, StateResult};

// ── Group ─────────────────────────────────────────────────────────

/// An autoscaling group as persisted.
///
/// `template`, `min_size`, `max_size` and `hosts` come from operator
/// config; only `desired_size` and `members` change at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupRecord {
    pub id: GroupId,
    pub template: InstanceTemplate,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_size: u32,
    /// Hosts this group may be placed on; empty means all.
    pub hosts: Vec<HostId>,
    /// Member instance IDs in creation order.
    pub members: Vec<InstanceId>,
    /// Sequence number handed to the next allocated instance.
    pub next_seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl GroupRecord {
    pub fn table_key(&self) -> String {
        self.id.clone()
    }

    /// Clamp `n` into `[min_size, max_size]`.
    pub fn clamp_size(&self, n: u32) -> u32 {
        n.clamp(self.min_size, self.max_size)
    }

    pub fn is_member(&self, instance_id: &str) -> bool {
        self.members.iter().any(|m| m == instance_id)
    }

    /// Allocate the next stable instance ID for this group.
    pub fn allocate_instance_id(&mut self) -> InstanceId {
        let id = format!("{}-{:06}", self.id, self.next_seq);
        self.next_seq += 1;
        id
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle of a managed VM.
///
/// ```text
/// Requested -> Provisioning -> Running -> Terminating -> Terminated
/// Requested | Provisioning -> Failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Allocated, waiting for placement.
    Requested,
    /// Placed on a host; create issued or pending retry.
    Provisioning,
    Running,
    /// Destroy issued or pending retry.
    Terminating,
    Terminated,
    /// Retries exhausted. Kept for diagnostics until reaped.
    Failed,
}

impl InstanceState {
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Requested, Failed)
                // A surplus request is dropped before it ever reaches a host.
                | (Requested, Terminated)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                // Explicit delete of an instance still being created.
                | (Provisioning, Terminating)
                | (Running, Terminating)
                // VM vanished from its host.
                | (Running, Terminated)
                | (Terminating, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Failed)
    }

    /// Whether the instance counts toward the group's current size.
    pub fn counts_toward_size(self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Provisioning)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Requested => "requested",
            InstanceState::Provisioning => "provisioning",
            InstanceState::Running => "running",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
            InstanceState::Failed => "failed",
        }
    }

    pub const ALL: [InstanceState; 6] = [
        InstanceState::Requested,
        InstanceState::Provisioning,
        InstanceState::Running,
        InstanceState::Terminating,
        InstanceState::Terminated,
        InstanceState::Failed,
    ];
}

/// A managed VM as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub group_id: GroupId,
    /// Creation sequence within the group; lower is older.
    pub seq: u64,
    pub host_id: Option<HostId>,
    pub vm_ref: Option<VmRef>,
    /// Resources reserved on `host_id`, fixed at allocation so a later
    /// template change never skews capacity accounting.
    pub resources: Resources,
    pub state: InstanceState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Named explicitly by an orchestrator delete request.
    #[serde(default)]
    pub marked_for_deletion: bool,
    /// Failed, but the VM may still exist on `host_id`. Capacity stays
    /// reserved until a destroy confirms it gone.
    #[serde(default)]
    pub cleanup_pending: bool,
    /// Static address drawn from the group's range; held until the
    /// record is removed or its VM is confirmed gone.
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl InstanceRecord {
    pub fn new(
        id: InstanceId,
        group_id: GroupId,
        seq: u64,
        resources: Resources,
        now: u64,
    ) -> Self {
        Self {
            id,
            group_id,
            seq,
            host_id: None,
            vm_ref: None,
            resources,
            state: InstanceState::Requested,
            retry_count: 0,
            last_error: None,
            marked_for_deletion: false,
            cleanup_pending: false,
            address: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn table_key(&self) -> String {
        instance_key(&self.group_id, &self.id)
    }

    /// Whether the instance has capacity reserved on its host.
    pub fn holds_capacity(&self) -> bool {
        self.host_id.is_some()
            && match self.state {
                InstanceState::Provisioning
                | InstanceState::Running
                | InstanceState::Terminating => true,
                InstanceState::Failed => self.cleanup_pending,
                InstanceState::Requested | InstanceState::Terminated => false,
            }
    }

    /// The static address this instance keeps others from taking.
    pub fn held_address(&self) -> Option<Ipv4Addr> {
        self.address.filter(|_| self.holds_capacity())
    }

    /// Move to `next`, rejecting transitions outside the lifecycle graph.
    pub fn transition(&mut self, next: InstanceState, now: u64) -> StateResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                instance: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Composite key for an instance record.
pub fn instance_key(group_id: &str, instance_id: &str) -> String {
    format!("{group_id}:{instance_id}")
}

// ── Requests ──────────────────────────────────────────────────────

/// Which orchestrator call a request ID was first seen on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    #[default]
    Increase,
    Delete,
}

/// Outcome of an idempotent orchestrator request, replayed on duplicates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRecord {
    pub group_id: GroupId,
    pub request_id: String,
    #[serde(default)]
    pub kind: RequestKind,
    /// Size change: instances added for an increase, newly marked for a delete.
    pub delta: u32,
    /// Desired size right after the request was applied.
    pub resulting_size: u32,
    pub recorded_at: u64,
}

impl RequestRecord {
    pub fn table_key(&self) -> String {
        request_key(&self.group_id, &self.request_id)
    }
}

pub fn request_key(group_id: &str, request_id: &str) -> String {
    format!("{group_id}:{request_id}")
}
