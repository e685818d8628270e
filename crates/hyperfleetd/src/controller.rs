//! Subsystem wiring and the daemon's main run loop.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use hyperfleet_api::build_router;
use hyperfleet_cluster::HostRegistry;
use hyperfleet_core::{ControllerConfig, VmGateway};
use hyperfleet_health::HostHealthChecker;
use hyperfleet_scheduler::{
    EngineConfig, GroupDefinition, GroupStore, ReconciliationEngine, RecoveryReport,
};
use hyperfleet_state::StateStore;

use crate::driver::ScalingDriver;

/// Every long-lived subsystem, built from one config.
pub struct Controller {
    config: ControllerConfig,
    engine: Arc<ReconciliationEngine>,
    health: HostHealthChecker,
}

impl Controller {
    /// Sync group definitions into `store`, register hosts and build the engine.
    pub async fn build(
        config: ControllerConfig,
        store: StateStore,
        gateway: Arc<dyn VmGateway>,
    ) -> anyhow::Result<Self> {
        let groups = Arc::new(GroupStore::new(store));
        let definitions = GroupDefinition::all(&config)?;
        let sync = groups.sync(&definitions).await?;
        info!(
            created = sync.created.len(),
            updated = sync.updated.len(),
            orphaned = sync.orphaned.len(),
            "group definitions synced"
        );

        let registry = Arc::new(HostRegistry::new());
        for spec in config.host_specs()? {
            registry.register(spec)?;
        }
        info!(hosts = registry.len(), "hosts registered");

        let health = HostHealthChecker::new(Arc::clone(&registry), config.health.clone());
        let engine = Arc::new(ReconciliationEngine::new(
            groups,
            registry,
            gateway,
            EngineConfig::from_config(&config.reconciliation, config.placement.order),
        ));

        Ok(Self {
            config,
            engine,
            health,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        self.engine.groups()
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        self.engine.registry()
    }

    /// Probe every host once, then reconcile persisted instances with
    /// what the hosts report. Runs before the first tick.
    pub async fn prepare(&self) -> anyhow::Result<RecoveryReport> {
        let reachable = self.health.probe_all().await;
        if reachable == 0 && self.registry().len() > 0 {
            warn!("no host reachable at startup; instances stay pending until one is");
        }

        let report = self.engine.recover().await?;
        info!(
            reserved = report.reserved,
            confirmed = report.confirmed,
            lost = report.lost,
            terminated = report.terminated,
            recreate = report.recreate,
            unknown = report.unknown,
            repaired = report.repaired,
            "startup recovery complete"
        );
        Ok(report)
    }

    /// Run until `signal` resolves or the engine halts on a fatal error.
    pub async fn run(
        self,
        driver: Box<dyn ScalingDriver>,
        listener: TcpListener,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        self.prepare().await?;
        self.health.start().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        // ── Engine ─────────────────────────────────────────────

        let engine = Arc::clone(&self.engine);
        let engine_shutdown = shutdown_rx.clone();
        let engine_tx = Arc::clone(&shutdown_tx);
        let engine_handle = tokio::spawn(async move {
            let result = engine.run(engine_shutdown).await;
            // A halted engine takes the daemon down with it.
            let _ = engine_tx.send(true);
            result
        });

        // ── Scaling driver ─────────────────────────────────────

        let driver_handles = driver.spawn(&self, shutdown_rx.clone());

        // ── API server ─────────────────────────────────────────

        let router = build_router(driver.api_state(&self));
        let addr = listener.local_addr()?;
        info!(%addr, mode = driver.name(), "API server starting");

        let mut server_shutdown = shutdown_rx.clone();
        let server_tx = Arc::clone(&shutdown_tx);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = signal => info!("shutdown signal received"),
                    _ = server_shutdown.changed() => {}
                }
                let _ = server_tx.send(true);
            })
            .await?;

        // ── Drain ──────────────────────────────────────────────

        self.health.stop_all().await;
        for handle in driver_handles {
            let _ = handle.await;
        }
        match engine_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "hyperfleetd stopping after engine failure");
                return Err(e.into());
            }
            Err(e) => return Err(anyhow::anyhow!("engine task failed: {e}")),
        }

        info!("hyperfleetd stopped");
        Ok(())
    }
}
