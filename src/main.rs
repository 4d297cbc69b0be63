//! Magi gateway binary: wires the fleet store, surface supervisor, session
//! multiplexer and CDP gateway together and serves Chrome's debugging
//! contract on loopback.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use magi_cdp_gateway::CdpGateway;
use magi_event_bus::FleetBus;
use magi_fleet_store::{BrowserSpec, FleetStore};
use magi_session_mux::SessionMultiplexer;
use magi_supervisor::SurfaceSupervisor;
use magi_surface::{PageDirectory, StubSurface, Surface};

mod config;

/// Magi: CDP gateway and session multiplexer for a fleet of embedded
/// browser surfaces.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter, e.g. "info" or "cdp-gateway=debug"
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the debugging HTTP/WebSocket endpoints
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Bind host; the gateway expects to stay on loopback
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(long)]
    port: Option<u16>,

    /// Serve the non-production /test/browser endpoints
    #[arg(long)]
    test_endpoints: bool,

    /// Number of browsers to start with
    #[arg(long, default_value_t = 1)]
    browsers: usize,
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.to_string()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut cfg = config::gateway_config_from_env();
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if args.test_endpoints {
        cfg.enable_test_endpoints = true;
    }

    // The embedded engine is provided by the hosting desktop process; this
    // binary runs against the in-memory surface.
    let surface = StubSurface::new() as Arc<dyn Surface>;
    let store = Arc::new(FleetStore::new());
    let bus = FleetBus::new(1024);
    let directory = Arc::new(PageDirectory::new());
    let supervisor = SurfaceSupervisor::new(
        Arc::clone(&surface),
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&directory),
    );
    let mux = SessionMultiplexer::new(surface, directory);
    mux.spawn_fleet_listener(&bus);

    for index in 0..args.browsers.max(1) {
        let record = supervisor
            .create_browser(BrowserSpec {
                name: format!("browser-{}", index + 1),
                partition_key: None,
                user_agent: None,
            })
            .await
            .context("creating default browser")?;
        info!(target: "magi", browser = %record.id, "browser ready");
    }

    let metrics_registry = prometheus::default_registry();
    magi_cdp_gateway::metrics::register_metrics(metrics_registry);

    let bind_addr = cfg.bind_addr();
    let gateway = CdpGateway::new(
        Arc::clone(&store),
        Arc::clone(&supervisor),
        Arc::clone(&mux),
        Arc::clone(&bus),
        cfg,
    );
    let router = gateway.build();

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(target: "magi", addr = %bind_addr, "cdp gateway listening");

    let mux_token = mux.cancel_token();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "magi", "shutdown requested");
        })
        .await
        .context("serving cdp gateway")?;

    mux_token.cancel();
    supervisor.shutdown().await;
    Ok(())
}
