//! relaybot entry point.

use anyhow::Context as _;
use clap::Parser;

use relaybot::api::{ApiState, start_http_server};
use relaybot::config::Config;
use relaybot::llm::{ModelClient, OpenRouterClient};
use relaybot::relay::Relay;
use relaybot::storage::Storage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "relaybot")]
#[command(about = "Conversational relay with persistent per-user history")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Address to serve HTTP on, overriding configuration
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load_from_path(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?,
        None => Config::load().with_context(|| "failed to load configuration from environment")?,
    };
    if let Some(bind) = cli.bind {
        config.api.bind = bind;
    }

    let _log_guard = relaybot::logging::init_tracing(cli.debug, config.log_dir.as_deref());
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let storage = Arc::new(
        Storage::connect(&config.storage)
            .await
            .with_context(|| "failed to initialize history storage")?,
    );
    tracing::info!(mode = %storage.mode().await, "history storage ready");

    let model: Arc<dyn ModelClient> = Arc::new(
        OpenRouterClient::new(config.model.clone())
            .with_context(|| "failed to initialize model client")?,
    );
    if !model.is_configured() {
        tracing::warn!("OPENROUTER_API_KEY is not set, /talk will answer with a configuration error");
    }
    tracing::info!(model = %model.model_name(), "model client ready");

    let relay = Arc::new(Relay::from_config(&config, storage, model));
    let state = Arc::new(ApiState::new(relay));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = start_http_server(config.api.bind, state, shutdown_rx)
        .await
        .with_context(|| format!("failed to bind HTTP server to {}", config.api.bind))?;

    tracing::info!("relaybot started");

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Err(error) = server.await {
        tracing::error!(%error, "HTTP server task failed");
    }

    tracing::info!("relaybot stopped");
    Ok(())
}
