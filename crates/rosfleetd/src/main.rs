//! rosfleetd — the rosfleet daemon.
//!
//! Single binary that assembles the control plane:
//! - Cluster registry, adapters and the resource state cache
//! - Placement and batch schedulers
//! - Task dispatch gateway with the local execution layer
//! - Supervisor driving every deployment and batch job
//! - Periodic jobs: cluster sync, reservation expiry, reconcile
//!
//! # Usage
//!
//! ```text
//! rosfleetd run --config fleet.toml --manifest warehouse.toml
//! rosfleetd check-config --config fleet.toml
//! rosfleetd check-config --scaffold > fleet.toml
//! rosfleetd plan --config fleet.toml --manifest warehouse.toml
//! ```

mod fleet;
mod plan;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use rosfleet_core::FleetConfig;
use rosfleet_reconcile::DeploymentManifest;

use crate::fleet::Fleet;

const DEFAULT_FILTER: &str = "info,rosfleetd=debug,rosfleet=debug";

#[derive(Parser)]
#[command(name = "rosfleetd", about = "rosfleet multi-cluster deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Run {
        /// Fleet configuration file.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Deployment or batch job manifests to submit at startup.
        #[arg(long = "manifest")]
        manifests: Vec<PathBuf>,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Print an example configuration instead.
        #[arg(long)]
        scaffold: bool,
    },
    /// Sync once and print the placement a manifest would get. Nothing
    /// is applied and every reservation is released afterwards.
    Plan {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        #[arg(long)]
        manifest: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            manifests,
            log_format,
        } => {
            init_tracing(log_format);
            run(config, manifests).await
        }
        Command::CheckConfig { scaffold: true, .. } => {
            print!("{}", FleetConfig::scaffold());
            Ok(())
        }
        Command::CheckConfig { config, .. } => {
            init_tracing(LogFormat::Text);
            check_config(config)
        }
        Command::Plan { config, manifest } => {
            init_tracing(LogFormat::Text);
            plan::run_plan(config, manifest).await
        }
    }
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(&path)?;
    for cluster in &config.clusters {
        info!(cluster = %cluster.name, kind = %cluster.kind, namespace = %cluster.namespace, "cluster registration ok");
    }
    println!("{}: {} clusters, configuration ok", path.display(), config.clusters.len());
    Ok(())
}

async fn run(config_path: PathBuf, manifests: Vec<PathBuf>) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "rosfleet daemon starting");
    let config = FleetConfig::from_file(&config_path)?;
    let fleet = Fleet::build(&config)?;

    // ── Initial sync ───────────────────────────────────────────

    for (cluster, result) in fleet.syncer.sync_all().await {
        match result {
            Ok(summary) => {
                info!(%cluster, nodes = summary.nodes, "cluster ready");
                match fleet.syncer.apply_node_labels(&cluster).await {
                    Ok(0) => {}
                    Ok(relabelled) => info!(%cluster, relabelled, "node labels applied"),
                    Err(e) => warn!(%cluster, error = %e, "node labels not applied"),
                }
            }
            Err(e) => warn!(%cluster, error = %e, "cluster unreachable at startup"),
        }
    }

    // ── Manifests ──────────────────────────────────────────────

    for path in &manifests {
        let manifest = DeploymentManifest::from_file(path)?;
        fleet.supervisor.submit(&manifest)?;
    }

    // ── Periodic jobs ──────────────────────────────────────────

    fleet.register_periodic(&config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let periodic = fleet.gateway.periodic().clone();
    let periodic_handle = tokio::spawn(periodic.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = periodic_handle.await;

    for name in fleet.supervisor.names() {
        let outcome = fleet.supervisor.outcome(&name);
        info!(%name, status = outcome.status(), "final state");
    }
    info!("rosfleet daemon stopped");
    Ok(())
}
