//! hyperfleetd — VM fleet autoscaler for bare-metal hypervisor hosts.
//!
//! # Usage
//!
//! ```text
//! hyperfleetd --config /etc/hyperfleet/hyperfleet.toml kubernetes --token "$TOKEN"
//! hyperfleetd --config ./hyperfleet.toml --log-format json standalone
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use hyperfleet_core::ControllerConfig;
use hyperfleet_hypervisor::{SeedBuilder, Virsh, VirshGateway, VirshMetrics};
use hyperfleet_state::StateStore;
use hyperfleetd::logging::{self, LogFormat};
use hyperfleetd::{Controller, KubernetesDriver, ScalingDriver, StandaloneDriver};

#[derive(Parser)]
#[command(name = "hyperfleetd", version, about = "hyperfleet VM fleet autoscaler")]
struct Cli {
    /// Controller config file.
    #[arg(long, short, global = true, default_value = "/etc/hyperfleet/hyperfleet.toml")]
    config: PathBuf,

    /// Append logs to this file instead of stdout.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Bearer token required on the scaling API.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Listen address; overrides `[api].listen`.
    #[arg(long, global = true)]
    listen: Option<String>,

    /// virsh client binary.
    #[arg(long, global = true, default_value = "virsh")]
    virsh: PathBuf,

    /// ISO builder used for cloud-init seed images.
    #[arg(long, global = true, default_value = "genisoimage")]
    seed_tool: PathBuf,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Mode {
    /// Serve the scaling protocol to an external cluster autoscaler.
    Kubernetes,
    /// Scale groups from sampled host utilization.
    Standalone,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.log_file.as_deref())?;

    let config = ControllerConfig::from_file(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    info!(path = %cli.config.display(), groups = config.groups.len(), hosts = config.hosts.len(), "config loaded");

    let state_path = config.state.path.clone();
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;
    }
    let store = StateStore::open(&state_path)
        .with_context(|| format!("opening state store {}", state_path.display()))?;
    info!(path = %state_path.display(), "state store opened");

    let virsh = Virsh::new(cli.virsh);
    let gateway = Arc::new(
        VirshGateway::new(virsh.clone(), "default").with_seed_builder(SeedBuilder::new(cli.seed_tool)),
    );
    let controller = Controller::build(config, store, gateway).await?;

    let driver: Box<dyn ScalingDriver> = match cli.mode {
        Mode::Kubernetes => Box::new(KubernetesDriver::new(cli.token)),
        Mode::Standalone => Box::new(
            StandaloneDriver::new(&controller, Arc::new(VirshMetrics::new(virsh)))
                .with_token(cli.token),
        ),
    };
    info!(mode = driver.name(), "hyperfleetd starting");

    let listen = cli
        .listen
        .unwrap_or_else(|| controller.config().api.listen.clone());
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;

    controller.run(driver, listener, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl-C handler; shutdown only by engine halt");
        std::future::pending::<()>().await;
    }
}
