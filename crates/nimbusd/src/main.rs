//! nimbusd — the Nimbus daemon.
//!
//! Single binary that assembles all Nimbus subsystems:
//! - State store (redb)
//! - Identity, RBAC/IAM and API keys
//! - Instance provisioning, auto-scaling, deployments, load balancers
//! - Cron dispatch, queues and topics, pipelines and builds
//! - REST API and the path-prefix gateway
//!
//! # Usage
//!
//! ```text
//! nimbusd standalone --port 8080 --data-dir /var/lib/nimbus --config nimbus.toml
//! ```

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nimbusd::{Backends, ControlPlane, NimbusConfig};

const DEFAULT_LOG_FILTER: &str = "info,nimbusd=debug,nimbus=debug";

#[derive(Parser)]
#[command(name = "nimbusd", about = "Nimbus control-plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every subsystem in one process against simulated backends.
    Standalone {
        /// API port (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Gateway port (overrides `server.gateway_port`).
        #[arg(long)]
        gateway_port: Option<u16>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            port,
            gateway_port,
            data_dir,
            config,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = NimbusConfig::load(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(port) = gateway_port {
                config.server.gateway_port = port;
            }
            if let Some(dir) = data_dir {
                config.server.data_dir = dir;
            }
            run_standalone(config).await
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn run_standalone(config: NimbusConfig) -> anyhow::Result<()> {
    info!("Nimbus daemon starting in standalone mode");

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("nimbus.redb");
    let store = nimbus_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let plane = ControlPlane::assemble(store, &config, Backends::simulated()).await?;
    info!("control plane assembled");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = plane.spawn_workers(shutdown_rx.clone());

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // ── Listeners ──────────────────────────────────────────────

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let gateway_addr = SocketAddr::from(([0, 0, 0, 0], config.server.gateway_port));
    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr).await?;
    info!(%api_addr, %gateway_addr, "listening");

    let api = axum::serve(api_listener, plane.router())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()))
        .into_future();
    let gateway = axum::serve(gateway_listener, plane.gateway_router())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .into_future();
    let (api, gateway) = tokio::join!(api, gateway);
    api?;
    gateway?;

    for worker in workers {
        let _ = worker.await;
    }

    info!("Nimbus daemon stopped");
    Ok(())
}
