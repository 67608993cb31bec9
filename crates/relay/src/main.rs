//! Relay node entry point.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay::{
    HttpIngestor, HttpTokenValidator, Ingestor, LogIngestor, RelayConfig, RelayServer,
    StaticTokenValidator, TokenValidator,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting relay node");

    let config = RelayConfig::from_env()?;

    info!("Configuration:");
    info!("  LISTEN_ADDR: {}", config.listen_addr);
    info!("  BACKBONE_URL: {}", config.backbone_url);
    info!("  CHANNEL: {} ({:?})", config.channel, config.topology);
    info!("  NODE_ID: {}", config.node_id);
    info!(
        "  VALIDATOR: {}",
        config.validator_url.as_deref().unwrap_or("static tokens")
    );
    info!(
        "  INGEST_URL: {}",
        config.ingest_url.as_deref().unwrap_or("<none>")
    );
    info!("  METRICS_PORT: {}", config.metrics_port);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let validator: Arc<dyn TokenValidator> = match &config.static_tokens {
        Some(tokens) => {
            let validator = StaticTokenValidator::parse(tokens)
                .context("STATIC_TOKENS must be comma-separated token:user pairs")?;
            warn!("Using {} static tokens; not for production", validator.len());
            Arc::new(validator)
        }
        None => {
            let url = config
                .validator_url
                .clone()
                .context("VALIDATOR_URL must be set")?;
            Arc::new(HttpTokenValidator::new(url, config.validator_timeout)?)
        }
    };

    let ingestor: Arc<dyn Ingestor> = match &config.ingest_url {
        Some(url) => Arc::new(HttpIngestor::new(url.clone(), config.ingest_timeout)?),
        None => Arc::new(LogIngestor),
    };

    info!("Connecting to backbone at {}", config.backbone_url);
    let backbone = pubsub_client::connect(&config.backbone_url).await?;
    info!("Connected to {} backbone", backbone.kind());

    let mut handle = RelayServer::start(config, validator, ingestor, backbone).await?;

    tokio::select! {
        _ = shutdown_signal() => {}
        result = handle.wait() => {
            if let Err(e) = result {
                error!("Server exited: {}", e);
            }
        }
    }

    handle.stop().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
