use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mahjong_ai::api;
use mahjong_ai::config::AppConfig;
use mahjong_ai::engine::Engine;

#[derive(Debug, Parser)]
#[command(name = "mahjong-ai", about = "Online DQN decision service")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the listen port from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Override the checkpoint directory from the config file.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(path) = cli.checkpoint {
        config.checkpoint.path = path;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mahjong_ai={}", config.server.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mahjong-ai v{}", env!("CARGO_PKG_VERSION"));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let engine = Arc::new(Mutex::new(Engine::new(config)));

    let app = api::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Persist whatever has been learned before exiting.
    info!("shutting down, saving model");
    let engine = engine.lock().await;
    if let Err(e) = engine.save_model() {
        warn!(error = %e, "final save failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}
