//! fedistore binary entry point

use fedistore::{Store, config, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Open the store (runs migrations)
/// 5. Wait for Ctrl-C, then close the store
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("fedistore={}", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        host = %config.instance.host,
        federation_mode = %config.instance.federation_mode,
        database = %config.database.path.display(),
        "Starting fedistore..."
    );

    // 3. Initialize metrics
    metrics::init_metrics();

    // 4. Open the store
    let store = Store::open(&config).await?;
    tracing::info!("Store ready");

    // 5. Run until interrupted
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    store.close().await;

    Ok(())
}
