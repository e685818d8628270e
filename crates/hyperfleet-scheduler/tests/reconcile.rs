//! Reconciliation engine behaviour against the in-memory gateway.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use hyperfleet_cluster::HostRegistry;
use hyperfleet_core::{
    HostSpec, InstanceTemplate, NetworkTemplate, PlacementOrder, Protocol, Resources, VmGateway,
};
use hyperfleet_scheduler::*;
use hyperfleet_state::{InstanceRecord, InstanceState, StateStore};

const GIB: u64 = 1 << 30;

fn host(name: &str, cpu: u32) -> HostSpec {
    HostSpec {
        name: name.to_string(),
        address: "10.0.0.1".to_string(),
        port: 22,
        protocol: Protocol::Ssh,
        hypervisor: "qemu".to_string(),
        user: None,
        capacity: Resources::new(cpu, 64 * GIB, 0),
    }
}

fn web(desired: u32, max: u32) -> GroupDefinition {
    GroupDefinition {
        id: "web".to_string(),
        template: InstanceTemplate::new("ubuntu-24.04", Resources::new(1, GIB, 0)),
        min_size: 0,
        max_size: max,
        desired_size: desired,
        hosts: vec![],
    }
}

fn static_web(desired: u32, max: u32) -> GroupDefinition {
    let mut group = web(desired, max);
    group.template.network = Some(NetworkTemplate {
        network: "fleet".to_string(),
        dhcp: false,
        gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
        netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
        subnet: None,
        address_range: Some("10.0.0.10-10.0.0.12".parse().unwrap()),
        address: None,
    });
    group
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        interval: Duration::from_millis(10),
        retry: RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        },
        gateway_timeout: Duration::from_secs(1),
        host_concurrency: 4,
        exhaustion_alert_after: Duration::ZERO,
        placement_order: PlacementOrder::MostAllocated,
    }
}

struct Fixture {
    engine: Arc<ReconciliationEngine>,
    groups: Arc<GroupStore>,
    registry: Arc<HostRegistry>,
    gateway: Arc<MemoryGateway>,
}

async fn fixture_with(
    store: StateStore,
    gateway: Arc<MemoryGateway>,
    hosts: &[(&str, u32)],
    group: GroupDefinition,
    config: EngineConfig,
) -> Fixture {
    let groups = Arc::new(GroupStore::new(store));
    groups.sync(&[group]).await.unwrap();

    let registry = Arc::new(HostRegistry::new());
    for (name, cpu) in hosts {
        registry.register(host(name, *cpu)).unwrap();
        registry.mark_reachable(name).unwrap();
    }

    let engine = Arc::new(ReconciliationEngine::new(
        Arc::clone(&groups),
        Arc::clone(&registry),
        Arc::clone(&gateway) as Arc<dyn VmGateway>,
        config,
    ));
    Fixture {
        engine,
        groups,
        registry,
        gateway,
    }
}

async fn fixture(hosts: &[(&str, u32)], group: GroupDefinition, config: EngineConfig) -> Fixture {
    fixture_with(
        StateStore::open_in_memory().unwrap(),
        Arc::new(MemoryGateway::new()),
        hosts,
        group,
        config,
    )
    .await
}

fn count(instances: &[InstanceRecord], state: InstanceState) -> usize {
    instances.iter().filter(|i| i.state == state).count()
}

fn running(f: &Fixture) -> usize {
    count(&f.groups.instances("web").unwrap(), InstanceState::Running)
}

#[tokio::test]
async fn converges_to_desired_and_stays_there() {
    let f = fixture(&[("kvm-1", 8), ("kvm-2", 8)], web(3, 10), fast_config()).await;

    let report = f.engine.tick().await.unwrap();
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].creates, 3);
    assert_eq!(running(&f), 3);
    assert_eq!(f.gateway.vm_count(), 3);

    // A converged group issues no further creates.
    let report = f.engine.tick().await.unwrap();
    assert_eq!(report.groups[0].creates, 0);
    assert_eq!(f.gateway.creates(), 3);

    let group = f.groups.get("web").unwrap();
    assert_eq!(group.members.len(), 3);
    assert_eq!(f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores, 3);
}

#[tokio::test]
async fn vm_refs_are_unique_per_host() {
    let f = fixture(&[("kvm-1", 4), ("kvm-2", 4)], web(6, 10), fast_config()).await;
    f.engine.tick().await.unwrap();

    let instances = f.groups.instances("web").unwrap();
    let pairs: HashSet<_> = instances
        .iter()
        .map(|i| (i.host_id.clone().unwrap(), i.vm_ref.clone().unwrap()))
        .collect();
    assert_eq!(pairs.len(), 6);
    assert_eq!(f.gateway.vm_count(), 6);
}

#[tokio::test]
async fn duplicate_increase_is_applied_once() {
    let f = fixture(&[("kvm-1", 8)], web(1, 10), fast_config()).await;
    f.engine.tick().await.unwrap();

    let first = f.groups.increase_size("web", 2, Some("req-1"), None).await.unwrap();
    let second = f.groups.increase_size("web", 2, Some("req-1"), None).await.unwrap();
    assert_eq!(first, 3);
    assert_eq!(second, 3);

    f.engine.tick().await.unwrap();
    assert_eq!(running(&f), 3);
}

#[tokio::test]
async fn scale_down_removes_oldest_first() {
    let f = fixture(&[("kvm-1", 8)], web(4, 10), fast_config()).await;
    f.engine.tick().await.unwrap();
    assert_eq!(running(&f), 4);

    f.groups.set_desired_size("web", 2).await.unwrap();
    let report = f.engine.tick().await.unwrap();
    assert_eq!(report.groups[0].destroys, 2);

    let ids: Vec<_> = f
        .groups
        .instances("web")
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, vec!["web-000002", "web-000003"]);
    assert_eq!(f.gateway.vm_count(), 2);
    assert_eq!(f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores, 2);
}

#[tokio::test]
async fn explicit_delete_terminates_named_instance() {
    let f = fixture(&[("kvm-1", 8)], web(3, 10), fast_config()).await;
    f.engine.tick().await.unwrap();

    let desired = f
        .groups
        .delete_instances("web", &["web-000001".to_string()], None)
        .await
        .unwrap();
    assert_eq!(desired, 2);

    f.engine.tick().await.unwrap();
    let ids: Vec<_> = f
        .groups
        .instances("web")
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, vec!["web-000000", "web-000002"]);

    // No replacement for the deleted instance.
    f.engine.tick().await.unwrap();
    assert_eq!(running(&f), 2);
    assert_eq!(f.gateway.creates(), 3);
}

#[tokio::test]
async fn capacity_exhaustion_is_surfaced_not_fatal() {
    let f = fixture(&[("kvm-1", 2)], web(5, 10), fast_config()).await;

    let report = f.engine.tick().await.unwrap();
    assert!(report.groups[0].exhausted);
    let instances = f.groups.instances("web").unwrap();
    assert_eq!(count(&instances, InstanceState::Running), 2);
    assert_eq!(count(&instances, InstanceState::Requested), 3);

    let status = f.engine.status().unwrap();
    let web = &status.groups[0];
    assert!(web.capacity_exhausted_since.is_some());
    assert!(web.capacity_alert);
    assert_eq!(web.requested, 3);

    // New capacity lets the pending requests through.
    f.registry.register(host("kvm-2", 8)).unwrap();
    f.registry.mark_reachable("kvm-2").unwrap();
    let report = f.engine.tick().await.unwrap();
    assert!(!report.groups[0].exhausted);
    assert_eq!(running(&f), 5);
    assert!(f.engine.status().unwrap().groups[0].capacity_exhausted_since.is_none());
}

#[tokio::test]
async fn pending_requests_dropped_when_desired_falls() {
    let f = fixture(&[("kvm-1", 2)], web(5, 10), fast_config()).await;
    f.engine.tick().await.unwrap();

    f.groups.set_desired_size("web", 2).await.unwrap();
    let report = f.engine.tick().await.unwrap();
    assert_eq!(report.groups[0].dropped, 3);

    let instances = f.groups.instances("web").unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(count(&instances, InstanceState::Running), 2);
    assert_eq!(f.groups.get("web").unwrap().members.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_fail_once_then_replace() {
    let mut config = fast_config();
    config.retry.max_retries = 2;
    let f = fixture(&[("kvm-1", 8)], web(1, 10), config).await;
    f.gateway.fail_next_creates(2);

    f.engine.tick().await.unwrap();
    let inst = f.groups.instances("web").unwrap().remove(0);
    assert_eq!(inst.state, InstanceState::Provisioning);
    assert_eq!(inst.retry_count, 1);
    assert!(inst.last_error.is_some());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = f.engine.tick().await.unwrap();
    assert_eq!(report.groups[0].failed, 1);
    let inst = f.groups.instances("web").unwrap().remove(0);
    assert!(inst.cleanup_pending);
    assert!(inst.holds_capacity());
    assert_eq!(
        f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores,
        1
    );

    // The next tick destroys whatever the failed create left and releases it.
    let report = f.engine.tick().await.unwrap();
    assert_eq!(report.groups[0].cleanups, 1);
    assert_eq!(report.groups[0].cleaned, 1);
    assert_eq!(f.gateway.destroys(), 1);
    assert_eq!(
        f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores,
        1
    );
    let instances = f.groups.instances("web").unwrap();
    assert_eq!(count(&instances, InstanceState::Failed), 1);
    assert_eq!(count(&instances, InstanceState::Running), 1);
    assert_eq!(instances.len(), 2);
    assert_eq!(f.engine.status().unwrap().failed_total, 1);

    // Further ticks neither retry the failed instance nor add replacements.
    f.engine.tick().await.unwrap();
    assert_eq!(f.groups.instances("web").unwrap().len(), 2);
    assert_eq!(f.gateway.creates(), 3);

    let reaped = f.groups.reap_failed("web").await.unwrap();
    assert_eq!(reaped, vec!["web-000000"]);
}

/// Every VM on the gateway belongs to an instance that still holds its
/// reservation, and the reservations add up to the registry's count.
fn assert_no_untracked_vms(f: &Fixture) {
    let instances = f.groups.instances("web").unwrap();
    let spec = f.registry.spec("kvm-1").unwrap();
    for (_, vm) in f.gateway.vms() {
        let owner = instances
            .iter()
            .find(|i| f.gateway.vm_ref(&spec, &i.id) == vm)
            .unwrap_or_else(|| panic!("vm {vm} has no instance"));
        assert!(owner.holds_capacity(), "vm {vm} of {} is untracked ({:?})", owner.id, owner.state);
    }
    let holding = instances.iter().filter(|i| i.holds_capacity()).count() as u32;
    assert_eq!(
        f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores,
        holding
    );
}

#[tokio::test]
async fn create_acknowledged_after_timeout_is_cleaned_up() {
    let mut config = fast_config();
    config.retry.max_retries = 2;
    config.gateway_timeout = Duration::from_millis(20);
    let f = fixture(&[("kvm-1", 8)], web(1, 10), config).await;
    f.gateway.set_create_ack_delay(Duration::from_millis(100));

    let mut failed = 0;
    for _ in 0..6 {
        let report = f.engine.tick().await.unwrap();
        failed += report.groups[0].failed;
        assert_no_untracked_vms(&f);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(failed >= 2, "only {failed} instances failed");

    f.gateway.set_create_ack_delay(Duration::ZERO);
    f.engine.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    f.engine.tick().await.unwrap();
    assert_no_untracked_vms(&f);

    assert_eq!(running(&f), 1);
    assert_eq!(f.gateway.vm_count(), 1);
    assert_eq!(f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores, 1);
    let instances = f.groups.instances("web").unwrap();
    let failed_ids: Vec<_> = instances
        .iter()
        .filter(|i| i.state == InstanceState::Failed)
        .map(|i| i.id.clone())
        .collect();
    assert!(instances.iter().all(|i| !i.cleanup_pending));
    assert_eq!(f.groups.reap_failed("web").await.unwrap(), failed_ids);
    assert_eq!(f.engine.status().unwrap().groups[0].cleanup_pending, 0);
}

#[tokio::test]
async fn cleanup_retries_until_destroy_succeeds() {
    let mut config = fast_config();
    config.retry.max_retries = 1;
    config.gateway_timeout = Duration::from_millis(20);
    let f = fixture(&[("kvm-1", 8)], web(1, 10), config).await;
    f.gateway.set_create_ack_delay(Duration::from_millis(100));
    f.gateway.fail_destroys(true);

    let report = f.engine.tick().await.unwrap();
    assert_eq!(report.groups[0].failed, 1);
    assert_eq!(f.gateway.vm_count(), 1);
    f.gateway.set_create_ack_delay(Duration::ZERO);

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.engine.tick().await.unwrap();
        assert_no_untracked_vms(&f);
    }
    let first = f.groups.instances("web").unwrap().remove(0);
    assert_eq!(first.state, InstanceState::Failed);
    assert!(first.cleanup_pending);
    assert!(first.last_error.is_some());
    assert_eq!(running(&f), 1);

    f.gateway.fail_destroys(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    f.engine.tick().await.unwrap();
    let first = f.groups.instances("web").unwrap().remove(0);
    assert!(!first.cleanup_pending);
    assert_eq!(f.gateway.vm_count(), 1);
    assert_no_untracked_vms(&f);
}

#[tokio::test]
async fn static_addresses_are_unique_and_reused() {
    let f = fixture(&[("kvm-1", 8)], static_web(3, 3), fast_config()).await;
    f.engine.tick().await.unwrap();

    let addresses: Vec<_> = f
        .groups
        .instances("web")
        .unwrap()
        .iter()
        .map(|i| i.address.unwrap())
        .collect();
    assert_eq!(
        addresses,
        [10, 11, 12].map(|last| Ipv4Addr::new(10, 0, 0, last))
    );
    let sent = f.gateway.template_of("web-000001").unwrap();
    assert_eq!(sent.network.unwrap().address, Some(Ipv4Addr::new(10, 0, 0, 11)));

    f.groups
        .delete_instances("web", &["web-000001".to_string()], None)
        .await
        .unwrap();
    f.engine.tick().await.unwrap();
    f.groups.set_desired_size("web", 3).await.unwrap();
    f.engine.tick().await.unwrap();

    let replacement = f
        .groups
        .instances("web")
        .unwrap()
        .into_iter()
        .find(|i| i.id == "web-000003")
        .unwrap();
    assert_eq!(replacement.state, InstanceState::Running);
    assert_eq!(replacement.address, Some(Ipv4Addr::new(10, 0, 0, 11)));
}

#[tokio::test]
async fn failed_create_waits_for_backoff() {
    let mut config = fast_config();
    config.retry.base = Duration::from_secs(60);
    config.retry.max = Duration::from_secs(60);
    let f = fixture(&[("kvm-1", 8)], web(1, 10), config).await;
    f.gateway.fail_next_creates(1);

    f.engine.tick().await.unwrap();
    let report = f.engine.tick().await.unwrap();
    assert_eq!(report.groups[0].creates, 0);
    assert_eq!(f.gateway.creates(), 1);
}

#[tokio::test]
async fn destroy_failures_retry_without_failing() {
    let mut config = fast_config();
    config.retry.max_retries = 1;
    let f = fixture(&[("kvm-1", 8)], web(1, 10), config).await;
    f.engine.tick().await.unwrap();

    f.gateway.fail_destroys(true);
    f.groups.set_desired_size("web", 0).await.unwrap();
    for _ in 0..3 {
        f.engine.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let inst = f.groups.instances("web").unwrap().remove(0);
    assert_eq!(inst.state, InstanceState::Terminating);
    assert!(inst.retry_count >= 2);

    f.gateway.fail_destroys(false);
    f.engine.tick().await.unwrap();
    assert!(f.groups.instances("web").unwrap().is_empty());
    assert_eq!(f.gateway.vm_count(), 0);
}

#[tokio::test]
async fn per_host_concurrency_is_capped() {
    let mut config = fast_config();
    config.host_concurrency = 2;
    let f = fixture(&[("kvm-1", 16)], web(8, 10), config).await;
    f.gateway.set_delay(Duration::from_millis(20));

    f.engine.tick().await.unwrap();
    assert_eq!(running(&f), 8);
    assert!(f.gateway.peak_in_flight("kvm-1") <= 2);
}

#[tokio::test]
async fn overlapping_passes_dispatch_each_instance_once() {
    let f = fixture(&[("kvm-1", 8)], web(2, 4), fast_config()).await;
    f.gateway.set_create_ack_delay(Duration::from_millis(50));

    let (a, b) = tokio::join!(
        f.engine.reconcile_group("web"),
        f.engine.reconcile_group("web")
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.creates + b.creates, 2);
    assert_eq!(f.gateway.creates(), 2);
    assert_eq!(f.gateway.vm_count(), 2);
    assert_eq!(running(&f), 2);
    assert_eq!(
        f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores,
        2
    );
}

#[tokio::test]
async fn groups_reconcile_side_by_side() {
    let f = fixture(&[("kvm-1", 8)], web(2, 4), fast_config()).await;
    let mut api = web(3, 4);
    api.id = "api".to_string();
    f.groups.sync(&[web(2, 4), api]).await.unwrap();
    f.gateway.set_create_ack_delay(Duration::from_millis(20));

    let report = f.engine.tick().await.unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.groups.len(), 2);
    let running_in = |group: &str| count(&f.groups.instances(group).unwrap(), InstanceState::Running);
    assert_eq!(running_in("api"), 3);
    assert_eq!(running_in("web"), 2);
    assert_eq!(f.gateway.creates(), 5);
    assert_eq!(
        f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores,
        5
    );
}

#[tokio::test]
async fn timed_out_calls_are_retried() {
    let mut config = fast_config();
    config.gateway_timeout = Duration::from_millis(20);
    let f = fixture(&[("kvm-1", 8)], web(1, 10), config).await;
    f.gateway.set_delay(Duration::from_millis(200));

    f.engine.tick().await.unwrap();
    let inst = f.groups.instances("web").unwrap().remove(0);
    assert_eq!(inst.state, InstanceState::Provisioning);
    assert!(inst.last_error.unwrap().contains("timed out"));

    f.gateway.set_delay(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(10)).await;
    f.engine.tick().await.unwrap();
    assert_eq!(running(&f), 1);
}

#[tokio::test]
async fn restart_creates_only_missing_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    let gateway = Arc::new(MemoryGateway::new());

    {
        let f = fixture_with(
            StateStore::open(&path).unwrap(),
            Arc::clone(&gateway),
            &[("kvm-1", 8)],
            web(2, 10),
            fast_config(),
        )
        .await;
        f.engine.tick().await.unwrap();
        assert_eq!(running(&f), 2);
        f.groups.set_desired_size("web", 3).await.unwrap();
    }

    let f = fixture_with(
        StateStore::open(&path).unwrap(),
        Arc::clone(&gateway),
        &[("kvm-1", 8)],
        web(2, 10),
        fast_config(),
    )
    .await;
    // Desired size survives the restart; sync does not reset it.
    assert_eq!(f.groups.target_size("web").unwrap(), 3);

    let recovery = f.engine.recover().await.unwrap();
    assert_eq!(recovery.reserved, 2);
    assert_eq!(recovery.confirmed, 2);
    assert_eq!(f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores, 2);

    let before = gateway.creates();
    f.engine.tick().await.unwrap();
    assert_eq!(gateway.creates() - before, 1);
    assert_eq!(running(&f), 3);
}

#[tokio::test]
async fn restart_keeps_pending_cleanup_reserved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    let gateway = Arc::new(MemoryGateway::new());
    let mut config = fast_config();
    config.retry.max_retries = 1;
    config.gateway_timeout = Duration::from_millis(20);

    {
        let f = fixture_with(
            StateStore::open(&path).unwrap(),
            Arc::clone(&gateway),
            &[("kvm-1", 8)],
            web(1, 10),
            config.clone(),
        )
        .await;
        gateway.set_create_ack_delay(Duration::from_millis(100));
        assert_eq!(f.engine.tick().await.unwrap().groups[0].failed, 1);
        gateway.set_create_ack_delay(Duration::ZERO);
    }
    assert_eq!(gateway.vm_count(), 1);

    let f = fixture_with(
        StateStore::open(&path).unwrap(),
        Arc::clone(&gateway),
        &[("kvm-1", 8)],
        web(1, 10),
        config,
    )
    .await;
    let recovery = f.engine.recover().await.unwrap();
    assert_eq!(recovery.reserved, 1);
    assert_eq!(f.registry.capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores, 1);

    let report = f.engine.tick().await.unwrap();
    assert_eq!(report.groups[0].cleaned, 1);
    assert_eq!(running(&f), 1);
    assert_eq!(gateway.vm_count(), 1);
    assert_no_untracked_vms(&f);
}

#[tokio::test]
async fn recovery_replaces_vanished_vm() {
    let f = fixture(&[("kvm-1", 8)], web(2, 10), fast_config()).await;
    f.engine.tick().await.unwrap();

    let victim = f.groups.instances("web").unwrap().remove(0);
    assert!(f.gateway.remove_vm("kvm-1", victim.vm_ref.as_ref().unwrap()));

    let recovery = f.engine.recover().await.unwrap();
    assert_eq!(recovery.lost, 1);
    assert_eq!(f.engine.status().unwrap().lost_total, 1);

    f.engine.tick().await.unwrap();
    let ids: Vec<_> = f
        .groups
        .instances("web")
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, vec!["web-000001", "web-000002"]);
    assert_eq!(running(&f), 2);
}

#[tokio::test]
async fn desired_is_clamped_and_converged() {
    let f = fixture(&[("kvm-1", 8)], web(1, 4), fast_config()).await;
    let err = f.groups.set_desired_size("web", 9).await.unwrap_err();
    assert!(matches!(err, GroupError::OutOfRange { applied: 4, .. }));

    f.engine.tick().await.unwrap();
    assert_eq!(running(&f), 4);
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let f = fixture(&[("kvm-1", 8)], web(2, 10), fast_config()).await;
    let (tx, rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(Arc::clone(&f.engine).run(rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    handle.await.unwrap().unwrap();
    assert_eq!(running(&f), 2);
    assert!(f.engine.status().unwrap().ticks >= 1);
}
