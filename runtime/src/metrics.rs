//! Prometheus metrics for the relay.
//!
//! Metrics are recorded through the `metrics` facade; without an installed
//! recorder every call is a no-op, which is what unit tests rely on.
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Scrape endpoint on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use relay_core::dead_letter::Stage;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or a recorder
    /// is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        tracing::info!(
            addr = %self.addr,
            "Metrics available at http://{}/metrics",
            self.addr
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "relay_bus_messages_total",
        "Bus messages handled, by outcome (ignored, dispatched, failed, stream_error)"
    );
    describe_counter!(
        "relay_events_persisted_total",
        "Domain events written to the event store"
    );
    describe_counter!(
        "relay_dead_letters_total",
        "Messages written to the dead-letter queue, by failed stage"
    );
    describe_counter!(
        "relay_deliveries_total",
        "Per-recipient sends, by outcome (delivered, failed)"
    );
    describe_counter!(
        "relay_registrations_total",
        "Start commands that registered or confirmed a subscriber"
    );
    describe_histogram!(
        "relay_pipeline_duration_seconds",
        "Time from receiving a bus message to finishing its fanout"
    );
}

/// Outcome label of a handled bus message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// No handler for the subject.
    Ignored,
    /// Persisted and fanned out.
    Dispatched,
    /// Failed at some stage.
    Failed,
    /// The bus yielded an error instead of a message.
    StreamError,
}

impl MessageOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
            Self::StreamError => "stream_error",
        }
    }
}

/// Relay metrics recorder.
pub struct RelayMetrics;

impl RelayMetrics {
    /// Record a handled bus message.
    pub fn record_message(outcome: MessageOutcome) {
        counter!("relay_bus_messages_total", "outcome" => outcome.as_str()).increment(1);
    }

    /// Record a stored event.
    pub fn record_persisted() {
        counter!("relay_events_persisted_total").increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_letter(stage: Stage) {
        counter!("relay_dead_letters_total", "stage" => stage.as_str()).increment(1);
    }

    /// Record one per-recipient send.
    pub fn record_delivery(delivered: bool) {
        let outcome = if delivered { "delivered" } else { "failed" };
        counter!("relay_deliveries_total", "outcome" => outcome).increment(1);
    }

    /// Record a handled start command.
    pub fn record_registration() {
        counter!("relay_registrations_total").increment(1);
    }

    /// Record the end-to-end pipeline time of one message.
    pub fn record_pipeline_duration(duration: Duration) {
        histogram!("relay_pipeline_duration_seconds").record(duration.as_secs_f64());
    }
}
