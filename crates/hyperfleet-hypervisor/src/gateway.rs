//! [`VmGateway`] over virsh.

use async_trait::async_trait;
use tracing::{debug, info};

use hyperfleet_core::{
    GatewayError, GatewayResult, HostSpec, InstanceTemplate, VmGateway, VmRef, VmStatus,
};

use crate::domain::{
    NoCloudSeed, parse_domstate, render_domain_xml, render_seed, seed_volume_name, volume_name,
};
use crate::seed::SeedBuilder;
use crate::virsh::{Failure, Virsh};

/// Creates each instance as a persistent domain named after its instance
/// ID, booting from a per-instance clone of the group image volume.
#[derive(Debug, Clone)]
pub struct VirshGateway {
    virsh: Virsh,
    pool: String,
    seeds: SeedBuilder,
}

impl Default for VirshGateway {
    fn default() -> Self {
        Self::new(Virsh::default(), "default")
    }
}

impl VirshGateway {
    pub fn new(virsh: Virsh, pool: impl Into<String>) -> Self {
        Self {
            virsh,
            pool: pool.into(),
            seeds: SeedBuilder::default(),
        }
    }

    pub fn with_seed_builder(mut self, seeds: SeedBuilder) -> Self {
        self.seeds = seeds;
        self
    }

    async fn domstate(&self, host: &HostSpec, name: &str) -> GatewayResult<Result<VmStatus, GatewayError>> {
        match self.virsh.run(host, &["domstate", name], None).await? {
            Ok(stdout) => Ok(parse_domstate(&stdout)),
            Err(Failure::NotFound) => Ok(Ok(VmStatus::Absent)),
            Err(f) => Err(f.into_gateway_error(&host.name)),
        }
    }

    /// Run a step where "already exists" means a previous attempt got this far.
    async fn ensure(&self, host: &HostSpec, args: &[&str], stdin: Option<&str>) -> GatewayResult<()> {
        match self.virsh.run(host, args, stdin).await? {
            Ok(_) | Err(Failure::Exists) => Ok(()),
            Err(f) => Err(f.into_gateway_error(&host.name)),
        }
    }

    /// Build the seed image and upload it as the instance's seed volume.
    async fn upload_seed(&self, host: &HostSpec, instance_id: &str, seed: &NoCloudSeed) -> GatewayResult<()> {
        let image = self.seeds.build(seed).await?;
        let volume = seed_volume_name(instance_id);
        let size = image.len().to_string();
        let pool = self.pool.as_str();
        self.ensure(
            host,
            &["vol-create-as", "--pool", pool, volume.as_str(), size.as_str(), "--format", "raw"],
            None,
        )
        .await?;
        let file = image.path().to_string_lossy();
        self.virsh
            .run_ok(host, &["vol-upload", "--pool", pool, volume.as_str(), file.as_ref()])
            .await?;
        debug!(host = %host.name, instance = instance_id, %volume, "seed uploaded");
        Ok(())
    }

    /// Delete a volume; a missing one is fine.
    async fn delete_volume(&self, host: &HostSpec, volume: &str) -> GatewayResult<()> {
        match self
            .virsh
            .run(host, &["vol-delete", "--pool", self.pool.as_str(), volume], None)
            .await?
        {
            Ok(_) | Err(Failure::NotFound) => Ok(()),
            Err(f) => Err(f.into_gateway_error(&host.name)),
        }
    }
}

#[async_trait]
impl VmGateway for VirshGateway {
    fn vm_ref(&self, _host: &HostSpec, instance_id: &str) -> VmRef {
        VmRef::new(instance_id)
    }

    async fn create(
        &self,
        host: &HostSpec,
        instance_id: &str,
        template: &InstanceTemplate,
    ) -> GatewayResult<VmRef> {
        let vm = self.vm_ref(host, instance_id);

        match self.domstate(host, instance_id).await? {
            Ok(VmStatus::Running) => {
                debug!(host = %host.name, instance = instance_id, "domain already running");
                return Ok(vm);
            }
            Ok(VmStatus::Absent) => {
                let volume = volume_name(instance_id);
                self.ensure(
                    host,
                    &["vol-clone", "--pool", self.pool.as_str(), template.image.as_str(), volume.as_str()],
                    None,
                )
                .await?;
                if let Some(seed) = render_seed(instance_id, template) {
                    self.upload_seed(host, instance_id, &seed).await?;
                }
                let xml = render_domain_xml(instance_id, template, &self.pool);
                self.ensure(host, &["define", "/dev/stdin"], Some(&xml)).await?;
            }
            // Defined but not running: a previous attempt stopped short of `start`.
            Err(_) => {}
        }

        self.ensure(host, &["start", instance_id], None).await?;
        info!(host = %host.name, instance = instance_id, "domain started");
        Ok(vm)
    }

    async fn destroy(&self, host: &HostSpec, vm: &VmRef) -> GatewayResult<()> {
        let name = vm.as_str();
        match self.virsh.run(host, &["destroy", name], None).await? {
            Ok(_) | Err(Failure::NotFound) | Err(Failure::NotRunning) => {}
            Err(f) => return Err(f.into_gateway_error(&host.name)),
        }
        match self
            .virsh
            .run(host, &["undefine", name, "--remove-all-storage"], None)
            .await?
        {
            Ok(_) | Err(Failure::NotFound) => {}
            Err(f) => return Err(f.into_gateway_error(&host.name)),
        }
        // Volumes a create left behind before its domain was defined.
        self.delete_volume(host, &volume_name(name)).await?;
        self.delete_volume(host, &seed_volume_name(name)).await
    }

    async fn status(&self, host: &HostSpec, vm: &VmRef) -> GatewayResult<VmStatus> {
        self.domstate(host, vm.as_str()).await?
    }
}
