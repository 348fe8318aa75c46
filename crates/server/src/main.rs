mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::Result;
use switchboard_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use switchboard_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging reads its level and format from config, so load it first.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.coordinator.clone(),
    )
    .await?;

    tracing::info!(
        event_name = "system.server.started",
        kv_backend = app.coordinator.kv().backend(),
        records_backend = app.coordinator.records().backend(),
        "switchboard-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", "switchboard-server stopping");

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.coordinator.shutdown()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            grace_secs = app.config.server.graceful_shutdown_secs,
            "coordinator did not stop within the grace period"
        );
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
