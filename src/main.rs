//! pixrelay server
//!
//! Loads configuration, sets up logging and serves image requests until
//! interrupted.

use anyhow::Context;
use pixrelay::{MetricsEndpoint, RelayConfig, RelayMetrics, RelayProxy, RelayServer, RequestContext};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Main entry point for the pixrelay server
///
/// # Usage
/// ```bash
/// # Start with default config (pixrelay.yaml)
/// pixrelay
///
/// # Start with custom config
/// pixrelay /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "pixrelay.yaml".to_string());

    let config = RelayConfig::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;

    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting {} {}", pixrelay::NAME, pixrelay::VERSION);
    info!("Configuration loaded from: {}", config_path);
    info!("  - Unsafe mode: {}", config.unsafe_mode);
    info!("  - Signature: {:?}", config.signature_algorithm);
    info!("  - Request timeout: {} ms", config.request_timeout_ms);
    info!("  - Save timeout: {} ms", config.save_timeout_ms);
    info!(
        "  - Cache: {} entries, {} bytes, {} shards",
        config.cache.max_entries, config.cache.max_bytes, config.cache.shards
    );

    let metrics = RelayMetrics::new().context("registering metrics")?;
    let proxy = Arc::new(
        RelayProxy::from_config(&config, Some(metrics.clone())).context("building backends")?,
    );

    let lifecycle = RequestContext::new();
    proxy.startup(&lifecycle).await.context("starting processors")?;

    let shutdown = CancellationToken::new();

    if let Some(ref endpoint) = config.metrics_endpoint {
        if endpoint.enabled {
            let addr: SocketAddr = endpoint
                .address
                .parse()
                .with_context(|| format!("invalid metrics address {}", endpoint.address))?;
            let endpoint = MetricsEndpoint::new(metrics.clone(), addr);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = endpoint.start(shutdown).await {
                    error!("Metrics endpoint failed: {}", e);
                }
            });
        }
    }

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address))?;
    let server = RelayServer::bind(Arc::clone(&proxy), addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let server_task = tokio::spawn(server.serve(shutdown.clone()));

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Image server failed: {}", e),
        Err(e) => error!("Image server task panicked: {}", e),
    }

    proxy.shutdown(&lifecycle).await.context("shutting down processors")?;
    info!("Server stopped");
    Ok(())
}
