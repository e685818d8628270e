//! REST handlers for the scaling protocol and operator views.
//!
//! Protocol handlers go through [`GroupStore`](hyperfleet_scheduler::GroupStore)
//! so every mutation takes the group's lock; the engine observes the new
//! desired size on its next tick.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use hyperfleet_cluster::HostFilter;
use hyperfleet_core::{GroupId, HostId, InstanceId, InstanceTemplate, VmRef};
use hyperfleet_scheduler::GroupError;
use hyperfleet_state::{InstanceRecord, InstanceState};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a group store error.
pub fn status_for(err: &GroupError) -> StatusCode {
    match err {
        GroupError::NotFound(_) => StatusCode::NOT_FOUND,
        GroupError::PreconditionFailed { .. } | GroupError::RequestConflict { .. } => {
            StatusCode::CONFLICT
        }
        GroupError::OutOfRange { .. }
        | GroupError::ExceedsMax { .. }
        | GroupError::InvalidDelta { .. }
        | GroupError::NotMember { .. }
        | GroupError::BelowMin { .. } => StatusCode::BAD_REQUEST,
        GroupError::Config(_) | GroupError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn group_error(err: GroupError) -> axum::response::Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "group store request failed");
    } else {
        debug!(error = %err, "group request rejected");
    }
    error_response(&err.to_string(), status).into_response()
}

// ── Groups ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupSummary {
    pub id: GroupId,
    pub min_size: u32,
    pub max_size: u32,
    pub target_size: u32,
    pub template: InstanceTemplate,
    pub hosts: Vec<HostId>,
    pub members: usize,
}

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>) -> impl IntoResponse {
    let groups = state.groups();
    let ids = match groups.list_groups() {
        Ok(ids) => ids,
        Err(e) => return group_error(e),
    };
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        match groups.get(&id) {
            Ok(g) => out.push(GroupSummary {
                members: g.members.len(),
                id: g.id,
                min_size: g.min_size,
                max_size: g.max_size,
                target_size: g.desired_size,
                template: g.template,
                hosts: g.hosts,
            }),
            Err(e) => return group_error(e),
        }
    }
    ApiResponse::ok(out).into_response()
}

/// GET /api/v1/groups/{id}
pub async fn get_group(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.groups().get(&id) {
        Ok(g) => ApiResponse::ok(GroupSummary {
            members: g.members.len(),
            id: g.id,
            min_size: g.min_size,
            max_size: g.max_size,
            target_size: g.desired_size,
            template: g.template,
            hosts: g.hosts,
        })
        .into_response(),
        Err(e) => group_error(e),
    }
}

// ── Sizing ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct TargetSize {
    pub group: GroupId,
    pub target_size: u32,
}

/// GET /api/v1/groups/{id}/target-size
pub async fn target_size(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.groups().target_size(&id) {
        Ok(size) => ApiResponse::ok(TargetSize {
            group: id,
            target_size: size,
        })
        .into_response(),
        Err(e) => group_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetSizeRequest {
    pub size: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SetSizeResponse {
    pub group: GroupId,
    pub target_size: u32,
    /// Set when the requested size was outside `[min, max]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clamped: Option<String>,
}

/// PUT /api/v1/groups/{id}/target-size
///
/// Out-of-range sizes are clamped and applied; the response says so.
pub async fn set_target_size(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<SetSizeRequest>,
) -> impl IntoResponse {
    match state.groups().set_desired_size(&id, req.size).await {
        Ok(applied) => ApiResponse::ok(SetSizeResponse {
            group: id,
            target_size: applied,
            clamped: None,
        })
        .into_response(),
        Err(e @ GroupError::OutOfRange { applied, .. }) => ApiResponse::ok(SetSizeResponse {
            group: id,
            target_size: applied,
            clamped: Some(e.to_string()),
        })
        .into_response(),
        Err(e) => group_error(e),
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IncreaseSizeRequest {
    pub delta: u32,
    /// Idempotency key; a repeated key replays the first result.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Fail unless the current target size equals this.
    #[serde(default)]
    pub expected_target_size: Option<u32>,
}

/// POST /api/v1/groups/{id}/increase-size
pub async fn increase_size(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<IncreaseSizeRequest>,
) -> impl IntoResponse {
    let result = state
        .groups()
        .increase_size(&id, req.delta, req.request_id.as_deref(), req.expected_target_size)
        .await;
    match result {
        Ok(size) => ApiResponse::ok(TargetSize {
            group: id,
            target_size: size,
        })
        .into_response(),
        Err(e) => group_error(e),
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteInstancesRequest {
    pub instances: Vec<InstanceId>,
    /// Idempotency key; a repeated key replays the first result.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// POST /api/v1/groups/{id}/delete-instances
pub async fn delete_instances(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<DeleteInstancesRequest>,
) -> impl IntoResponse {
    if req.instances.is_empty() {
        return error_response("no instances named", StatusCode::BAD_REQUEST).into_response();
    }
    match state
        .groups()
        .delete_instances(&id, &req.instances, req.request_id.as_deref())
        .await
    {
        Ok(size) => ApiResponse::ok(TargetSize {
            group: id,
            target_size: size,
        })
        .into_response(),
        Err(e) => group_error(e),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// Protocol-level instance status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Deleting,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct InstanceView {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub state: InstanceState,
    pub host: Option<HostId>,
    pub vm_ref: Option<VmRef>,
    /// Set for Failed instances: the create gave up with this error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<InstanceRecord> for InstanceView {
    fn from(r: InstanceRecord) -> Self {
        let status = match r.state {
            InstanceState::Requested | InstanceState::Provisioning | InstanceState::Failed => {
                InstanceStatus::Creating
            }
            InstanceState::Running if r.marked_for_deletion => InstanceStatus::Deleting,
            InstanceState::Running => InstanceStatus::Running,
            InstanceState::Terminating | InstanceState::Terminated => InstanceStatus::Deleting,
        };
        let error = (r.state == InstanceState::Failed)
            .then(|| r.last_error.unwrap_or_else(|| "retries exhausted".to_string()));
        Self {
            id: r.id,
            status,
            state: r.state,
            host: r.host_id,
            vm_ref: r.vm_ref,
            error,
        }
    }
}

/// GET /api/v1/groups/{id}/instances
pub async fn list_instances(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.groups().instances(&id) {
        Ok(instances) => {
            let views: Vec<InstanceView> = instances.into_iter().map(InstanceView::from).collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => group_error(e),
    }
}

/// POST /api/v1/groups/{id}/reap
pub async fn reap_failed(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.groups().reap_failed(&id).await {
        Ok(reaped) => ApiResponse::ok(serde_json::json!({
            "group": id,
            "reaped": reaped,
        }))
        .into_response(),
        Err(e) => group_error(e),
    }
}

// ── Hosts & status ─────────────────────────────────────────────

/// GET /api/v1/hosts
pub async fn list_hosts(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.engine.registry().list(HostFilter::All))
}

/// GET /api/v1/status
pub async fn engine_status(State(state): State<ApiState>) -> impl IntoResponse {
    match state.engine.status() {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => {
            error!(error = %e, "failed to read engine status");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let status = match state.engine.status() {
        Ok(status) => status,
        Err(e) => {
            error!(error = %e, "failed to read engine status");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    let hosts = state.engine.registry().list(HostFilter::All);
    let utilization = match &state.collector {
        Some(collector) => collector.snapshot().await,
        None => Vec::new(),
    };

    let body = hyperfleet_metrics::render_prometheus(&status, &hosts, &utilization);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
