//! Daemon wiring: build, startup recovery, run modes and shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tower::ServiceExt;

use hyperfleet_api::build_router;
use hyperfleet_cluster::Liveness;
use hyperfleet_core::{
    ControllerConfig, GatewayResult, HostSpec, HostUtilization, MetricsSource, VmGateway,
};
use hyperfleet_scheduler::MemoryGateway;
use hyperfleet_state::{InstanceState, StateStore};
use hyperfleetd::{Controller, KubernetesDriver, ScalingDriver, StandaloneDriver};

/// Accepts health probes for the configured host.
async fn hypervisor_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn config(port: u16, desired: u32) -> ControllerConfig {
    ControllerConfig::parse(&format!(
        r#"
[reconciliation]
interval = "20ms"
max_retries = 3
backoff_base = "10ms"
backoff_max = "50ms"
gateway_timeout = "1s"
host_concurrency = 4
exhaustion_alert_after = "1m"

[health]
interval = "1s"
timeout = "500ms"
unhealthy_threshold = 3

[metrics]
interval = "20ms"
trailing = 3
host_timeout = "1s"

[[hosts]]
name = "kvm-1"
address = "127.0.0.1"
port = {port}
protocol = "tls"
resources = {{ cpu = 8, memory = "32GiB" }}

[groups.web]
image = "ubuntu-24.04"
template = {{ cpu = 1, memory = "1GiB" }}
scaling = {{ min = 1, max = 6, desired = {desired}, cooldown = "0s", high_water = 0.8, low_water = 0.2 }}
"#
    ))
    .unwrap()
}

async fn controller(
    port: u16,
    desired: u32,
    store: StateStore,
    gateway: &Arc<MemoryGateway>,
) -> Controller {
    Controller::build(
        config(port, desired),
        store,
        Arc::clone(gateway) as Arc<dyn VmGateway>,
    )
    .await
    .unwrap()
}

struct HotSource;

#[async_trait]
impl MetricsSource for HotSource {
    async fn sample(&self, _host: &HostSpec) -> GatewayResult<HostUtilization> {
        Ok(HostUtilization {
            cpu: 0.95,
            memory: 0.4,
        })
    }
}

#[tokio::test]
async fn build_syncs_groups_and_registers_hosts() {
    let (_hv, port) = hypervisor_port().await;
    let gateway = Arc::new(MemoryGateway::new());
    let ctl = controller(port, 2, StateStore::open_in_memory().unwrap(), &gateway).await;

    assert_eq!(ctl.groups().list_groups().unwrap(), vec!["web"]);
    assert_eq!(ctl.groups().target_size("web").unwrap(), 2);
    assert_eq!(ctl.registry().len(), 1);
    assert_eq!(ctl.registry().liveness("kvm-1").unwrap(), Liveness::Unknown);
}

#[tokio::test]
async fn prepare_probes_hosts_then_recovers() {
    let (_hv, port) = hypervisor_port().await;
    let gateway = Arc::new(MemoryGateway::new());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hyperfleet.redb");

    // First run converges the group.
    let first = controller(port, 2, StateStore::open(&path).unwrap(), &gateway).await;
    first.prepare().await.unwrap();
    first.engine().tick().await.unwrap();
    assert_eq!(gateway.vm_count(), 2);
    drop(first);

    // Restart against the same store with desired raised to 3.
    let second = controller(port, 2, StateStore::open(&path).unwrap(), &gateway).await;
    second.groups().set_desired_size("web", 3).await.unwrap();
    let report = second.prepare().await.unwrap();
    assert_eq!(second.registry().liveness("kvm-1").unwrap(), Liveness::Reachable);
    assert_eq!(report.reserved, 2);
    assert_eq!(report.confirmed, 2);
    assert_eq!(report.lost, 0);
    assert_eq!(
        second.registry().capacity_snapshot("kvm-1").unwrap().allocated.cpu_cores,
        2
    );

    let creates_before = gateway.creates();
    second.engine().tick().await.unwrap();
    assert_eq!(gateway.creates() - creates_before, 1);
    let running = second
        .groups()
        .instances("web")
        .unwrap()
        .iter()
        .filter(|i| i.state == InstanceState::Running)
        .count();
    assert_eq!(running, 3);
}

#[tokio::test]
async fn kubernetes_driver_serves_protocol_behind_token() {
    let (_hv, port) = hypervisor_port().await;
    let gateway = Arc::new(MemoryGateway::new());
    let ctl = controller(port, 2, StateStore::open_in_memory().unwrap(), &gateway).await;

    let driver = KubernetesDriver::new(Some("s3cret".to_string()));
    let (_tx, rx) = watch::channel(false);
    assert!(driver.spawn(&ctl, rx).is_empty());
    let router = build_router(driver.api_state(&ctl));

    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/groups/web/increase-size")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"delta":1}"#))
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(ctl.groups().target_size("web").unwrap(), 2);

    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/groups/web/increase-size")
        .header("content-type", "application/json")
        .header("authorization", "Bearer s3cret")
        .body(Body::from(r#"{"delta":1,"request_id":"scale-up-1"}"#))
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(ctl.groups().target_size("web").unwrap(), 3);
}

#[tokio::test]
async fn standalone_driver_scales_on_utilization() {
    let (_hv, port) = hypervisor_port().await;
    let gateway = Arc::new(MemoryGateway::new());
    let ctl = controller(port, 2, StateStore::open_in_memory().unwrap(), &gateway).await;
    ctl.prepare().await.unwrap();

    let driver = StandaloneDriver::new(&ctl, Arc::new(HotSource));
    let (tx, rx) = watch::channel(false);
    let handles = driver.spawn(&ctl, rx);
    assert_eq!(handles.len(), 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let target = ctl.groups().target_size("web").unwrap();
    assert!(target > 2, "target stayed at {target}");
    assert!(target <= 6);
    assert!(driver.collector().host_average("kvm-1").await.is_some());

    tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn run_serves_until_signal() {
    let (_hv, port) = hypervisor_port().await;
    let gateway = Arc::new(MemoryGateway::new());
    let ctl = controller(port, 2, StateStore::open_in_memory().unwrap(), &gateway).await;
    let engine = Arc::clone(ctl.engine());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run = tokio::spawn(ctl.run(
        Box::new(KubernetesDriver::default()),
        listener,
        async move {
            let _ = stop_rx.await;
        },
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let status = engine.status().unwrap();
    assert!(status.ticks >= 1);
    assert_eq!(status.groups[0].running, 2);
    assert_eq!(gateway.vm_count(), 2);
}
