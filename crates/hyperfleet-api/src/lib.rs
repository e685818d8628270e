//! hyperfleet-api — the scaling protocol server.
//!
//! Provider side of a cluster-autoscaler style protocol over HTTP/JSON,
//! plus read-only views of engine state for operators.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/groups` | List groups |
//! | GET | `/api/v1/groups/{id}` | Group definition and size |
//! | GET | `/api/v1/groups/{id}/target-size` | Desired size |
//! | PUT | `/api/v1/groups/{id}/target-size` | Set desired size (clamped) |
//! | POST | `/api/v1/groups/{id}/increase-size` | Add to desired size |
//! | POST | `/api/v1/groups/{id}/delete-instances` | Terminate named instances |
//! | GET | `/api/v1/groups/{id}/instances` | Members with status |
//! | POST | `/api/v1/groups/{id}/reap` | Remove Failed instances |
//! | GET | `/api/v1/hosts` | Hosts with liveness and capacity |
//! | GET | `/api/v1/status` | Engine status |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/healthz` | Liveness |
//!
//! With a token configured, every `/api/v1` route requires
//! `Authorization: Bearer <token>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use hyperfleet_metrics::MetricsCollector;
use hyperfleet_scheduler::{GroupStore, ReconciliationEngine};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<ReconciliationEngine>,
    /// Present in standalone mode, where host utilization is sampled.
    pub collector: Option<Arc<MetricsCollector>>,
    pub token: Option<Arc<str>>,
}

impl ApiState {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self {
            engine,
            collector: None,
            token: None,
        }
    }

    pub fn with_collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_token(mut self, token: impl Into<Arc<str>>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        self.engine.groups()
    }
}

/// Build the complete router (protocol API + metrics + health).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/groups", get(handlers::list_groups))
        .route("/groups/{id}", get(handlers::get_group))
        .route(
            "/groups/{id}/target-size",
            get(handlers::target_size).put(handlers::set_target_size),
        )
        .route("/groups/{id}/increase-size", post(handlers::increase_size))
        .route("/groups/{id}/delete-instances", post(handlers::delete_instances))
        .route("/groups/{id}/instances", get(handlers::list_instances))
        .route("/groups/{id}/reap", post(handlers::reap_failed))
        .route("/hosts", get(handlers::list_hosts))
        .route("/status", get(handlers::engine_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
