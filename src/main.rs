//! annotation-market - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the marketplace API.

use annotation_market::{api, config::Config};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "annotation_market=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        store = ?config.store_type,
        data_dir = %config.data_dir.display(),
        network = %config.market.settlement.network,
        max_payment = %config.market.settlement.max_amount,
        "Loaded configuration"
    );
    if config.dev_mode {
        warn!("DEV_MODE is on: identity headers are trusted without verification");
    }

    // Start HTTP server
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting server on {}", addr);

    api::serve(config).await?;

    Ok(())
}
