//! [`MetricsSource`] over virsh node statistics.

use async_trait::async_trait;

use hyperfleet_core::{GatewayResult, HostSpec, HostUtilization, MetricsSource};

use crate::domain::utilization;
use crate::virsh::Virsh;

#[derive(Debug, Clone, Default)]
pub struct VirshMetrics {
    virsh: Virsh,
}

impl VirshMetrics {
    pub fn new(virsh: Virsh) -> Self {
        Self { virsh }
    }
}

#[async_trait]
impl MetricsSource for VirshMetrics {
    async fn sample(&self, host: &HostSpec) -> GatewayResult<HostUtilization> {
        let (cpu, mem) = tokio::try_join!(
            self.virsh.run_ok(host, &["nodecpustats", "--percent"]),
            self.virsh.run_ok(host, &["nodememstats"]),
        )?;
        utilization(&cpu, &mem)
    }
}
