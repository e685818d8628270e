//! Narrow traits over the hypervisor.
//!
//! The controller never talks to a hypervisor directly. It issues
//! intent-level requests through [`VmGateway`] and reads host load
//! through [`MetricsSource`]; adapters live in `hyperfleet-hypervisor`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{HostSpec, HostUtilization, InstanceTemplate, VmRef, VmStatus};

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced by a gateway call. All of them are retryable from the
/// controller's point of view.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("hypervisor rejected request: {0}")]
    Rejected(String),

    #[error("unexpected hypervisor output: {0}")]
    Protocol(String),
}

/// VM lifecycle operations against one host.
///
/// Implementations must be safe to repeat:
/// - `create` is keyed by `instance_id`; creating an instance that already
///   exists returns the existing reference.
/// - `destroy` of a VM that is already gone succeeds.
/// - `status` of a VM that is already gone returns [`VmStatus::Absent`].
///
/// The reference `create` returns must be derivable from the host and
/// instance ID alone (see [`VmGateway::vm_ref`]), so a VM whose create
/// outcome was never observed can still be addressed.
#[async_trait]
pub trait VmGateway: Send + Sync {
    /// The reference `create` returns for `instance_id` on `host`.
    fn vm_ref(&self, host: &HostSpec, instance_id: &str) -> VmRef;

    async fn create(
        &self,
        host: &HostSpec,
        instance_id: &str,
        template: &InstanceTemplate,
    ) -> GatewayResult<VmRef>;

    async fn destroy(&self, host: &HostSpec, vm: &VmRef) -> GatewayResult<()>;

    async fn status(&self, host: &HostSpec, vm: &VmRef) -> GatewayResult<VmStatus>;
}

/// Source of aggregate host utilization.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self, host: &HostSpec) -> GatewayResult<HostUtilization>;
}
