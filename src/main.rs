// src/main.rs - fleet host entry point
use clap::Parser;
use forge_rs::fleet::Fleet;
use forge_rs::web;
use forge_shared::config::load_config;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "forge-host", version, about = "Host for a fleet of serial fabrication devices")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "forge.toml")]
    config: String,

    /// Maximum log level
    #[arg(long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    tracing::info!("Starting forge-host {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loading configuration from: {}", args.config);

    let config = load_config(&args.config).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", args.config, e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    let fleet = Arc::new(Fleet::from_config(&config).await.map_err(|e| {
        tracing::error!("Failed to bring up devices: {}", e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?);
    if let Err(e) = fleet.restore_jobs().await {
        tracing::warn!("Could not restore persisted jobs: {}", e);
    }
    for device in &config.devices {
        tracing::info!("Device {}: {} on {:?} {}", device.id, device.model, device.transport, device.port);
    }

    let app = web::create_router(fleet.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down");
    fleet.shutdown().await;
    Ok(())
}
