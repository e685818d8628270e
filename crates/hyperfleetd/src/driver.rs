//! Run modes.
//!
//! The engine only ever reads desired sizes. A [`ScalingDriver`] decides
//! who writes them: an external orchestrator through the scaling API
//! (`kubernetes`), or the built-in threshold autoscaler (`standalone`).

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use hyperfleet_api::ApiState;
use hyperfleet_autoscale::{Autoscaler, ScalingPolicy};
use hyperfleet_core::MetricsSource;
use hyperfleet_metrics::MetricsCollector;

use crate::controller::Controller;

pub trait ScalingDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start the tasks that move desired sizes. Each must exit once
    /// `shutdown` flips.
    fn spawn(&self, controller: &Controller, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>>;

    /// State for the API router in this mode.
    fn api_state(&self, controller: &Controller) -> ApiState;
}

/// Desired sizes come from an orchestrator calling the scaling API.
#[derive(Debug, Default)]
pub struct KubernetesDriver {
    token: Option<String>,
}

impl KubernetesDriver {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl ScalingDriver for KubernetesDriver {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn spawn(&self, _controller: &Controller, _shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(auth = self.token.is_some(), "desired sizes driven through the scaling API");
        Vec::new()
    }

    fn api_state(&self, controller: &Controller) -> ApiState {
        let state = ApiState::new(Arc::clone(controller.engine()));
        match &self.token {
            Some(token) => state.with_token(token.as_str()),
            None => state,
        }
    }
}

/// Desired sizes come from host utilization and per-group policies.
pub struct StandaloneDriver {
    collector: Arc<MetricsCollector>,
    policies: Vec<ScalingPolicy>,
    token: Option<String>,
}

impl StandaloneDriver {
    pub fn new(controller: &Controller, source: Arc<dyn MetricsSource>) -> Self {
        let collector = Arc::new(MetricsCollector::new(
            source,
            Arc::clone(controller.registry()),
            &controller.config().metrics,
        ));
        Self {
            collector,
            policies: ScalingPolicy::all(controller.config()),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }
}

impl ScalingDriver for StandaloneDriver {
    fn name(&self) -> &'static str {
        "standalone"
    }

    fn spawn(&self, controller: &Controller, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let collector = Arc::clone(&self.collector);
        let collector_shutdown = shutdown.clone();
        let collector_handle = tokio::spawn(async move {
            collector.run(collector_shutdown).await;
        });

        let mut autoscaler = Autoscaler::new(
            Arc::clone(controller.groups()),
            Arc::clone(&self.collector),
            self.policies.clone(),
        );
        let interval = controller.config().metrics.interval();
        let autoscale_handle = tokio::spawn(async move {
            autoscaler.run(interval, shutdown).await;
        });

        vec![collector_handle, autoscale_handle]
    }

    fn api_state(&self, controller: &Controller) -> ApiState {
        let state = ApiState::new(Arc::clone(controller.engine()))
            .with_collector(Arc::clone(&self.collector));
        match &self.token {
            Some(token) => state.with_token(token.as_str()),
            None => state,
        }
    }
}
