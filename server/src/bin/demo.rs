//! Notification Relay Demo
//!
//! Publishes one `customer.registered` message so a running relay has
//! something to store and fan out.
//!
//! # Usage
//!
//! ```bash
//! # Relay running against the same brokers
//! cargo run --bin relay-demo -- Ana Lee
//! ```

use relay_core::event::SUBJECT_CUSTOMER_REGISTERED;
use relay_core::event_bus::EventBus;
use relay_redpanda::RedpandaEventBus;
use relay_server::config::RedpandaConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let first_name = args.next().unwrap_or_else(|| "Ana".to_string());
    let last_name = args.next().unwrap_or_else(|| "Lee".to_string());

    let config = RedpandaConfig::from_env();
    let event_bus = RedpandaEventBus::builder()
        .brokers(&config.brokers)
        .build()?;

    let body = serde_json::json!({
        "pattern": SUBJECT_CUSTOMER_REGISTERED,
        "data": {
            "payload": {
                "id": "demo-1",
                "tenantId": "demo",
                "email": "demo@example.com",
                "firstName": first_name,
                "lastName": last_name,
                "country": "US",
                "language": "en"
            }
        }
    });

    event_bus
        .publish(SUBJECT_CUSTOMER_REGISTERED, &serde_json::to_vec(&body)?)
        .await?;

    println!("Published {SUBJECT_CUSTOMER_REGISTERED} for {first_name} {last_name}");
    Ok(())
}
