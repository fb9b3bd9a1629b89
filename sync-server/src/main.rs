//! carelog-sync-server binary entry point.
//!
//! Usage:
//! ```bash
//! carelog-sync-server --config server.toml
//! ```

use carelog_sync_server::config::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carelog_sync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = get_config_path();
    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        tracing::warn!(
            "Config file {} not found, using defaults",
            config_path.display()
        );
        Config::default()
    };

    tracing::info!(
        "carelog-sync-server v{} starting, database {}",
        env!("CARGO_PKG_VERSION"),
        config.storage.database.display()
    );

    carelog_sync_server::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await?;

    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("server.toml"))
}
