//! etcd-snapshot-driver: group snapshot controller for etcd on Kubernetes.
//!
//! ## Commands
//! - `serve`: run the gRPC health service and readiness prober until SIGINT/SIGTERM
//! - `create --name N --volume ns/pvc...`: take a group snapshot
//! - `get <id>` / `delete <id>`: inspect or remove a group snapshot
//!
//! ## Configuration
//! - `--config` or ETCD_SNAPSHOT_CONFIG: YAML config file
//! - ETCD_SNAPSHOT__<SECTION>__<FIELD>: per-field overrides
//! - ETCD_SNAPSHOT_LOG: tracing filter (default "info")

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use etcd_snapshot_driver::config::Config;
use etcd_snapshot_driver::etcd::tls::load_tls_config;
use etcd_snapshot_driver::etcd::GrpcClusterDialer;
use etcd_snapshot_driver::orchestration::GroupSnapshotOrchestrator;
use etcd_snapshot_driver::platform::KubePlatform;
use etcd_snapshot_driver::utils::bootstrap::{init_tracing, shutdown_on_signal};
use etcd_snapshot_driver::utils::readiness::{run_readiness_prober, serve_health};

#[derive(Parser)]
#[command(name = "etcd-snapshot-driver")]
#[command(about = "Group snapshots for etcd clusters on Kubernetes")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve gRPC health until shutdown
    Serve,
    /// Create a group snapshot
    Create {
        /// Snapshot name; the group id is `<name>-<unix seconds>`
        #[arg(long)]
        name: String,
        /// Source volume as `namespace/pvc` (repeatable)
        #[arg(long = "volume", required = true)]
        volumes: Vec<String>,
    },
    /// Show a group snapshot
    Get { group_snapshot_id: String },
    /// Delete a group snapshot
    Delete { group_snapshot_id: String },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    init_tracing(config.logging.format);
    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;
    let config = Arc::new(config);

    let platform = Arc::new(KubePlatform::try_default().await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_on_signal(shutdown_tx));

    match cli.command {
        Commands::Serve => serve(config, platform, shutdown_rx).await,
        Commands::Create { name, volumes } => {
            let orchestrator = orchestrator(config, platform, shutdown_rx)?;
            let group = orchestrator.create(&name, &volumes).await?;
            print_json(&group)
        }
        Commands::Get { group_snapshot_id } => {
            let orchestrator = orchestrator(config, platform, shutdown_rx)?;
            let group = orchestrator.get(&group_snapshot_id).await?;
            print_json(&group)
        }
        Commands::Delete { group_snapshot_id } => {
            let orchestrator = orchestrator(config, platform, shutdown_rx)?;
            orchestrator.delete(&group_snapshot_id).await?;
            info!(group_snapshot_id = %group_snapshot_id, "Deleted");
            Ok(())
        }
        Commands::Version => Ok(()),
    }
}

async fn serve(
    config: Arc<Config>,
    platform: Arc<KubePlatform>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = config.server.health_address.parse()?;
    let interval = config.server.readiness_interval();
    let ready = Arc::new(AtomicBool::new(false));

    info!(address = %addr, "Starting etcd-snapshot-driver");

    let prober = tokio::spawn(run_readiness_prober(
        platform,
        ready.clone(),
        interval,
        shutdown.clone(),
    ));

    serve_health(addr, ready, interval, shutdown).await?;

    if let Err(e) = prober.await {
        warn!(error = %e, "Readiness prober task failed");
    }
    info!("Shutdown complete");
    Ok(())
}

fn orchestrator(
    config: Arc<Config>,
    platform: Arc<KubePlatform>,
    shutdown: watch::Receiver<bool>,
) -> Result<GroupSnapshotOrchestrator, Box<dyn std::error::Error>> {
    // `Config::validate` requires controller credentials whenever TLS is on.
    let tls = config
        .health
        .controller_tls
        .as_ref()
        .map(|tls| load_tls_config(&tls.cert_path, &tls.key_path, &tls.ca_path))
        .transpose()?;
    let dialer = Arc::new(GrpcClusterDialer::new(tls, config.health.dial_timeout()));

    Ok(GroupSnapshotOrchestrator::new(
        config,
        platform.clone(),
        platform.clone(),
        platform,
        dialer,
        shutdown,
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
