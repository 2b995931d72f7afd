// ABOUTME: Main entry point for the turngate gateway.
// ABOUTME: Initializes logging, config, stores, coordinator, and both transport servers.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turngate::config::Config;
use turngate::nodes::NodeRegistry;
use turngate::ops::Operations;
use turngate::server;
use turngate_core::{
    EventBus, RunCoordinator, RunRegistry, SendPolicy, SessionStore, SqliteTranscript,
    TranscriptLog,
};
use turngate_engine::EngineRegistry;

#[derive(Debug, Parser)]
#[command(name = "turngate", about = "Gateway coordinating shared agent turns")]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from config.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before they take the process down.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: {}", panic_info);
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    tracing::info!("Starting turngate gateway");

    if let Some(ref metrics_addr) = config.server.metrics_addr {
        let addr: std::net::SocketAddr = metrics_addr.parse()?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        tracing::info!(addr = %metrics_addr, "Metrics exporter listening");
    }

    let state_dir = config.state_dir()?;
    let sessions = Arc::new(SessionStore::open(state_dir.join("turngate.db"))?);
    let transcript: Arc<dyn TranscriptLog> =
        Arc::new(SqliteTranscript::new(sessions.db_connection())?);
    let bus = Arc::new(EventBus::default());
    let registry = Arc::new(RunRegistry::new());

    let engine = EngineRegistry::default()
        .create(&config.engine.backend, &config.engine_options())
        .with_context(|| format!("Failed to create engine: {}", config.engine.backend))?;
    tracing::info!(engine = %engine.name(), "Engine ready");

    let coordinator = RunCoordinator::new(
        engine,
        Arc::clone(&bus),
        registry,
        Arc::clone(&sessions),
        transcript,
        SendPolicy::new(config.policy.rules.clone()),
    );

    let nodes = Arc::new(NodeRegistry::new());
    let ops = Operations::new(
        coordinator,
        bus,
        nodes,
        config.bridge.default_session_key.clone(),
        config.bridge.pairing_required,
    );

    server::run(&config.server.listen_addr, ops).await
}
