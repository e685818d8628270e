//! In-memory [`VmGateway`] with failure injection.
//!
//! Behaves like a well-mannered hypervisor: create is idempotent per
//! instance ID, destroy of a missing VM succeeds, status of a missing VM
//! is `Absent`. Used by tests across the workspace.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use hyperfleet_core::{
    GatewayError, GatewayResult, HostId, HostSpec, InstanceTemplate, VmGateway, VmRef, VmStatus,
};

#[derive(Debug, Default)]
struct Inner {
    /// host -> vm_ref -> instance id
    vms: BTreeMap<HostId, BTreeMap<VmRef, String>>,
    /// Template of the latest create per instance.
    templates: BTreeMap<String, InstanceTemplate>,
    fail_next_creates: u32,
    fail_all_creates: bool,
    fail_destroys: bool,
    delay: Duration,
    create_ack_delay: Duration,
    in_flight: HashMap<HostId, usize>,
    peak_in_flight: HashMap<HostId, usize>,
}

#[derive(Debug, Default)]
pub struct MemoryGateway {
    inner: Mutex<Inner>,
    creates: AtomicU64,
    destroys: AtomicU64,
    status_calls: AtomicU64,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` create calls.
    pub fn fail_next_creates(&self, n: u32) {
        self.inner().fail_next_creates = n;
    }

    pub fn fail_all_creates(&self, fail: bool) {
        self.inner().fail_all_creates = fail;
    }

    pub fn fail_destroys(&self, fail: bool) {
        self.inner().fail_destroys = fail;
    }

    /// Delay every call, e.g. to trip the engine's gateway timeout.
    pub fn set_delay(&self, delay: Duration) {
        self.inner().delay = delay;
    }

    /// Hold back a create's answer after the VM already exists, so a
    /// caller's timeout can fire on a VM that was built.
    pub fn set_create_ack_delay(&self, delay: Duration) {
        self.inner().create_ack_delay = delay;
    }

    /// Pretend a VM already exists, as after a controller restart.
    pub fn insert_running(&self, host: &str, instance_id: &str) -> VmRef {
        let vm = vm_ref(host, instance_id);
        self.inner()
            .vms
            .entry(host.to_string())
            .or_default()
            .insert(vm.clone(), instance_id.to_string());
        vm
    }

    /// Make a VM disappear behind the controller's back.
    pub fn remove_vm(&self, host: &str, vm: &VmRef) -> bool {
        self.inner()
            .vms
            .get_mut(host)
            .is_some_and(|vms| vms.remove(vm).is_some())
    }

    /// Every live VM as `(host, vm_ref)`.
    pub fn vms(&self) -> Vec<(HostId, VmRef)> {
        self.inner()
            .vms
            .iter()
            .flat_map(|(host, vms)| vms.keys().map(move |vm| (host.clone(), vm.clone())))
            .collect()
    }

    /// The template the latest create of `instance_id` carried.
    pub fn template_of(&self, instance_id: &str) -> Option<InstanceTemplate> {
        self.inner().templates.get(instance_id).cloned()
    }

    pub fn vm_count(&self) -> usize {
        self.inner().vms.values().map(BTreeMap::len).sum()
    }

    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    pub fn destroys(&self) -> u64 {
        self.destroys.load(Ordering::Relaxed)
    }

    pub fn status_calls(&self) -> u64 {
        self.status_calls.load(Ordering::Relaxed)
    }

    /// Highest number of simultaneous calls seen against `host`.
    pub fn peak_in_flight(&self, host: &str) -> usize {
        self.inner().peak_in_flight.get(host).copied().unwrap_or(0)
    }

    async fn enter(&self, host: &str) {
        let delay = {
            let mut inner = self.inner();
            let n = inner.in_flight.entry(host.to_string()).or_default();
            *n += 1;
            let n = *n;
            let peak = inner.peak_in_flight.entry(host.to_string()).or_default();
            *peak = (*peak).max(n);
            inner.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self, host: &str) {
        if let Some(n) = self.inner().in_flight.get_mut(host) {
            *n = n.saturating_sub(1);
        }
    }
}

fn vm_ref(host: &str, instance_id: &str) -> VmRef {
    VmRef::new(format!("{host}/{instance_id}"))
}

#[async_trait]
impl VmGateway for MemoryGateway {
    fn vm_ref(&self, host: &HostSpec, instance_id: &str) -> VmRef {
        vm_ref(&host.name, instance_id)
    }

    async fn create(
        &self,
        host: &HostSpec,
        instance_id: &str,
        template: &InstanceTemplate,
    ) -> GatewayResult<VmRef> {
        self.creates.fetch_add(1, Ordering::Relaxed);
        self.enter(&host.name).await;
        let (result, ack_delay) = {
            let mut inner = self.inner();
            let result = if inner.fail_all_creates {
                Err(GatewayError::Rejected("injected create failure".into()))
            } else if inner.fail_next_creates > 0 {
                inner.fail_next_creates -= 1;
                Err(GatewayError::Rejected("injected create failure".into()))
            } else {
                let vm = vm_ref(&host.name, instance_id);
                inner
                    .vms
                    .entry(host.name.clone())
                    .or_default()
                    .insert(vm.clone(), instance_id.to_string());
                inner.templates.insert(instance_id.to_string(), template.clone());
                Ok(vm)
            };
            (result, inner.create_ack_delay)
        };
        self.leave(&host.name);
        if !ack_delay.is_zero() {
            tokio::time::sleep(ack_delay).await;
        }
        result
    }

    async fn destroy(&self, host: &HostSpec, vm: &VmRef) -> GatewayResult<()> {
        self.destroys.fetch_add(1, Ordering::Relaxed);
        self.enter(&host.name).await;
        let result = {
            let mut inner = self.inner();
            if inner.fail_destroys {
                Err(GatewayError::Unreachable(host.name.clone()))
            } else {
                if let Some(vms) = inner.vms.get_mut(&host.name) {
                    vms.remove(vm);
                }
                Ok(())
            }
        };
        self.leave(&host.name);
        result
    }

    async fn status(&self, host: &HostSpec, vm: &VmRef) -> GatewayResult<VmStatus> {
        self.status_calls.fetch_add(1, Ordering::Relaxed);
        self.enter(&host.name).await;
        let present = self
            .inner()
            .vms
            .get(&host.name)
            .is_some_and(|vms| vms.contains_key(vm));
        self.leave(&host.name);
        Ok(if present {
            VmStatus::Running
        } else {
            VmStatus::Absent
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperfleet_core::{Protocol, Resources};

    fn host() -> HostSpec {
        HostSpec {
            name: "kvm-1".into(),
            address: "127.0.0.1".into(),
            port: 22,
            protocol: Protocol::Ssh,
            hypervisor: "qemu".into(),
            user: None,
            capacity: Resources::new(8, 8 << 30, 0),
        }
    }

    fn template() -> InstanceTemplate {
        InstanceTemplate::new("img", Resources::new(1, 1 << 30, 0))
    }

    #[tokio::test]
    async fn create_is_idempotent_per_instance() {
        let gw = MemoryGateway::new();
        let a = gw.create(&host(), "web-000000", &template()).await.unwrap();
        let b = gw.create(&host(), "web-000000", &template()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(gw.vm_count(), 1);
        assert_eq!(gw.creates(), 2);
    }

    #[tokio::test]
    async fn destroy_of_missing_vm_succeeds() {
        let gw = MemoryGateway::new();
        let vm = gw.create(&host(), "web-000000", &template()).await.unwrap();
        gw.destroy(&host(), &vm).await.unwrap();
        gw.destroy(&host(), &vm).await.unwrap();
        assert_eq!(gw.status(&host(), &vm).await.unwrap(), VmStatus::Absent);
    }

    #[tokio::test]
    async fn derived_ref_matches_created_ref() {
        let gw = MemoryGateway::new();
        let vm = gw.create(&host(), "web-000003", &template()).await.unwrap();
        assert_eq!(gw.vm_ref(&host(), "web-000003"), vm);
    }

    #[tokio::test]
    async fn late_ack_leaves_vm_behind_on_timeout() {
        let gw = MemoryGateway::new();
        gw.set_create_ack_delay(Duration::from_millis(200));
        let (host, template) = (host(), template());
        let create = gw.create(&host, "web-000000", &template);
        assert!(tokio::time::timeout(Duration::from_millis(20), create).await.is_err());
        assert_eq!(gw.vms(), vec![("kvm-1".to_string(), gw.vm_ref(&host, "web-000000"))]);
    }

    #[tokio::test]
    async fn injected_failures_count_down() {
        let gw = MemoryGateway::new();
        gw.fail_next_creates(2);
        assert!(gw.create(&host(), "a", &template()).await.is_err());
        assert!(gw.create(&host(), "a", &template()).await.is_err());
        assert!(gw.create(&host(), "a", &template()).await.is_ok());
    }
}
