//! Coordinator node entry point.
//!
//! Wires config, transport, the session coordinator, and the optional HTTP
//! initiation surface. One process per participant.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tss_api::{start_server, AppState};
use tss_coordinator::{CoordinatorConfig, SessionCoordinator};
use tss_network::PeerRegistry;
use tss_provider::CurvProvider;

#[derive(Debug, Parser)]
#[command(name = "tss-node", about = "Threshold signing coordinator node")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the transport listen port (0 disables server mode).
    #[arg(long)]
    listen_port: Option<u16>,

    /// Override the HTTP API port (0 disables the initiation surface).
    #[arg(long)]
    api_port: Option<u16>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = CoordinatorConfig::load(args.config.as_deref())?;
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(port) = args.api_port {
        config.api_port = port;
    }

    info!(
        participant = config.participant_id,
        name = %config.name,
        role = %config.role,
        peers = config.peers.len(),
        "starting coordinator node"
    );

    let registry = Arc::new(PeerRegistry::new(config.local_id()));
    let provider = Arc::new(CurvProvider::new());
    let api_port = config.api_port;
    let listen_port = config.listen_port;
    let coordinator = SessionCoordinator::new(config, provider, registry);

    if listen_port > 0 {
        let addr = coordinator
            .serve_transport(&format!("0.0.0.0:{listen_port}"))
            .await?;
        info!(address = %addr, "transport listening");
    }

    // Peer dial-out retries with fixed backoff until each peer attaches.
    coordinator.connect_configured_peers();

    if api_port > 0 {
        let addr: SocketAddr = format!("0.0.0.0:{api_port}").parse()?;
        start_server(AppState::new(coordinator), addr).await?;
    } else {
        info!("server mode disabled, running headless");
        // Transport and dispatch tasks keep the process alive.
        std::future::pending::<()>().await;
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

