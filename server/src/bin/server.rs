//! Notification Relay Server
//!
//! This binary:
//! - Applies the `PostgreSQL` migrations
//! - Consumes domain events from Redpanda and fans them out to Telegram
//! - Registers chats that send `/start` to the bot
//! - Optionally serves Prometheus metrics (`METRICS_ADDR`)
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run server
//! TG_BOT_TOKEN=... cargo run --bin relay-server
//! ```

use relay_runtime::metrics::MetricsServer;
use relay_server::{Config, RelayApp, shutdown_signal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relay=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting notification relay...");

    let config = Config::from_env()?;
    tracing::info!(
        redpanda = %config.redpanda.brokers,
        subjects = ?config.redpanda.subjects,
        policy = %config.relay.failure_policy,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr).start()?;
    }

    let app = RelayApp::from_config(config).await?;
    app.run(shutdown_signal()).await?;

    Ok(())
}
