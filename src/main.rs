//! dredge - telemetry relay for dredger sensor units
//!
//! Polls sensor units over TCP, decodes their frames into named channels and
//! relays the readings to downstream clients as JSON lines.

use dredge_server::{run_metrics_server, Config, Metrics, Server, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if DREDGE_CONFIG is set, then env overrides)
    let config_path = std::env::var("DREDGE_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting dredge relay");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Poll interval: {:?}, connect timeout: {:?}",
        config.sensor.poll_interval(),
        config.sensor.connect_timeout()
    );
    tracing::info!(
        "  Frame format: ai_length_unit={:?}, float_byte_order={:?}, max_buffer={} bytes",
        config.sensor.ai_length_unit,
        config.sensor.float_byte_order,
        config.sensor.max_buffer_size
    );
    tracing::info!(
        "  Vessel profiles: {} (default {})",
        config.vessels.profile_names().join(", "),
        config.vessels.default_profile
    );

    let mut server_config = ServerConfig::from_config(&config);

    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config));

    let metrics_task = metrics_handle.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        })
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
