//! Explicit wiring of the relay.
//!
//! [`RelayApp::from_config`] builds every component from [`Config`] and hands
//! each one exactly the capabilities it uses:
//!
//! ```text
//! Postgres pool ─┬─ PostgresEventStore ─────────┐
//!                ├─ PostgresSubscriberRegistry ─┼─ Pipeline ── BusListener ◄── Redpanda
//!                └─ DeadLetterQueue ────────────┘      │
//!                                 TemplateRenderer ────┤
//!                                 TelegramBot ─────────┴─ RegistrationListener
//! ```
//!
//! [`RelayApp::run`] spawns both listeners and stops them together.

use crate::config::Config;
use relay_core::dead_letter::DeadLetterSink;
use relay_core::event_bus::{EventBus, EventBusError};
use relay_core::event_store::{EventStore, StorageError};
use relay_postgres::{
    DeadLetterQueue, PoolSettings, PostgresEventStore, PostgresSubscriberRegistry,
};
use relay_redpanda::RedpandaEventBus;
use relay_runtime::{
    BusListener, FanoutDispatcher, Pipeline, PipelineError, RegistrationListener, RenderError,
    TemplateRenderer,
};
use relay_telegram::TelegramBot;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Startup or runtime failure of the relay.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database setup failed.
    #[error("Storage setup failed: {0}")]
    Storage(#[from] StorageError),

    /// Event bus setup failed.
    #[error("Event bus setup failed: {0}")]
    EventBus(#[from] EventBusError),

    /// Template renderer setup failed.
    #[error("Renderer setup failed: {0}")]
    Renderer(#[from] RenderError),

    /// The bus listener stopped on a pipeline failure under the halt policy.
    #[error("Bus listener halted: {0}")]
    Halted(#[source] PipelineError),

    /// A listener task panicked or was cancelled.
    #[error("Listener task failed: {0}")]
    Task(String),
}

/// The assembled relay.
pub struct RelayApp {
    config: Arc<Config>,
    event_bus: Arc<dyn EventBus>,
    bot: Arc<TelegramBot>,
    registry: Arc<PostgresSubscriberRegistry>,
    renderer: Arc<TemplateRenderer>,
    pipeline: Arc<Pipeline>,
}

impl RelayApp {
    /// Connect to every collaborator and build the pipeline.
    ///
    /// Applies the database migrations before anything else touches the
    /// database.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the database is unreachable, a migration
    /// fails, the bus client cannot be created, or the template engine
    /// cannot be initialised.
    pub async fn from_config(config: Config) -> Result<Self, AppError> {
        info!("Connecting to database...");
        let pool = relay_postgres::connect(
            &config.postgres.url,
            &PoolSettings {
                max_connections: config.postgres.max_connections,
                acquire_timeout: Duration::from_secs(config.postgres.connect_timeout),
            },
        )
        .await?;

        info!("Running database migrations...");
        relay_postgres::migrate(&pool).await?;

        let store = Arc::new(PostgresEventStore::from_pool(pool.clone()));
        let registry = Arc::new(PostgresSubscriberRegistry::from_pool(pool.clone()));
        let dead_letters = Arc::new(DeadLetterQueue::new(pool));
        let stored_events = store.count().await?;
        let pending_dead_letters = dead_letters.count_pending().await?;
        info!(stored_events, pending_dead_letters, "Storage ready");

        info!("Connecting to event bus...");
        let event_bus: Arc<dyn EventBus> = Arc::new(
            RedpandaEventBus::builder()
                .brokers(&config.redpanda.brokers)
                .consumer_group(&config.redpanda.consumer_group)
                .auto_offset_reset(&config.redpanda.auto_offset_reset)
                .build()?,
        );

        let bot = Arc::new(
            TelegramBot::new(config.telegram.bot_token.clone())
                .with_api_url(config.telegram.api_url.clone())
                .with_poll_timeout(Duration::from_secs(config.telegram.poll_timeout))
                .with_retry_delay(config.relay.retry_delay()),
        );

        let renderer = Arc::new(TemplateRenderer::new(&config.relay.template_dir)?);
        let dispatcher = FanoutDispatcher::new(registry.clone(), bot.clone())
            .with_max_concurrent_sends(config.relay.max_concurrent_sends);
        let pipeline = Arc::new(
            Pipeline::new(store, renderer.clone(), dispatcher, dead_letters)
                .with_policy(config.relay.failure_policy),
        );

        info!(
            subjects = ?config.redpanda.subjects,
            templates = %config.relay.template_dir.display(),
            policy = %config.relay.failure_policy,
            "Relay assembled"
        );

        Ok(Self {
            config: Arc::new(config),
            event_bus,
            bot,
            registry,
            renderer,
            pipeline,
        })
    }

    /// Run both listeners until `shutdown` resolves or the bus listener halts.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Halted`] when the bus listener stopped on a
    /// pipeline failure, or [`AppError::Task`] if a listener task died.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), AppError> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut bus = BusListener::new(
            "relay",
            self.config.redpanda.subjects.clone(),
            self.event_bus.clone(),
            self.pipeline.clone(),
            shutdown_tx.subscribe(),
        )
        .with_retry_delay(self.config.relay.retry_delay())
        .spawn();

        let registrations = RegistrationListener::new(
            self.bot.clone(),
            self.registry.clone(),
            self.bot.clone(),
            self.renderer.clone(),
            shutdown_tx.subscribe(),
        )
        .with_retry_delay(self.config.relay.retry_delay())
        .spawn();

        info!("Relay is running");

        let bus_result = tokio::select! {
            () = shutdown => {
                info!("Shutting down gracefully...");
                let _ = shutdown_tx.send(());
                (&mut bus).await
            }
            result = &mut bus => {
                warn!("Bus listener stopped, stopping registration listener");
                let _ = shutdown_tx.send(());
                result
            }
        };

        if let Err(e) = registrations.await {
            warn!(error = %e, "Registration listener task failed");
        }

        match bus_result {
            Ok(Ok(())) => {
                info!("Relay stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(AppError::Halted(e)),
            Err(e) => Err(AppError::Task(e.to_string())),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
///
/// If a handler cannot be installed the error is logged and that signal is
/// never reported.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
