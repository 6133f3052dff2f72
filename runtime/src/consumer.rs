//! Bus listener with automatic reconnection.
//!
//! [`BusListener`] owns the subscribe-process-reconnect loop that binds a bus
//! subscription to a [`MessageHandler`]:
//!
//! ```text
//! loop {
//!     subscribe:
//!         loop {
//!             next message -> handler
//!             handler error -> stop listener
//!             shutdown -> return
//!         }
//!     stream ended / subscribe failed:
//!         wait retry_delay, resubscribe
//! }
//! ```
//!
//! Messages are handled one at a time, in the order the bus yields them. A
//! message is acknowledged only after the handler returned `Ok`, so the bus
//! commits nothing that has not been persisted or dead-lettered. A handler
//! error is fatal to the listener and leaves the failed message (and every
//! message buffered behind it) unacknowledged; isolating failures is the
//! handler's decision (see [`crate::pipeline::FailurePolicy`]).

use crate::metrics::{MessageOutcome, RelayMetrics};
use crate::pipeline::{Pipeline, PipelineError};
use async_trait::async_trait;
use futures::StreamExt;
use relay_core::ack::Received;
use relay_core::event_bus::{BusMessage, EventBus, MessageStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default delay before resubscribing.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Processes one bus message.
///
/// Returning an error stops the listener.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle `message`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when the listener must stop.
    async fn handle(&self, message: &BusMessage) -> Result<(), PipelineError>;
}

#[async_trait]
impl MessageHandler for Pipeline {
    async fn handle(&self, message: &BusMessage) -> Result<(), PipelineError> {
        Self::handle(self, message).await.map(|_| ())
    }
}

enum StreamEnd {
    Shutdown,
    Disconnected,
}

/// Long-running consumer of bus subjects.
pub struct BusListener {
    name: String,
    subjects: Vec<String>,
    event_bus: Arc<dyn EventBus>,
    handler: Arc<dyn MessageHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
}

impl BusListener {
    /// Create a listener with [`DEFAULT_RETRY_DELAY`].
    ///
    /// # Arguments
    ///
    /// * `name` - Listener name for logging
    /// * `subjects` - Bus subjects to subscribe to
    /// * `event_bus` - Bus to consume from
    /// * `handler` - Handler for each message, usually a [`Pipeline`]
    /// * `shutdown` - Broadcast receiver for graceful shutdown
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        subjects: Vec<String>,
        event_bus: Arc<dyn EventBus>,
        handler: Arc<dyn MessageHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            subjects,
            event_bus,
            handler,
            shutdown,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the delay before resubscribing.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Spawn the listener as a background task.
    ///
    /// The task resolves to the handler error that stopped it, or `Ok(())`
    /// after a shutdown signal.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<(), PipelineError>> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown or until the handler returns an error.
    ///
    /// # Errors
    ///
    /// Returns the [`PipelineError`] that stopped the listener.
    pub async fn run(mut self) -> Result<(), PipelineError> {
        info!(listener = %self.name, subjects = ?self.subjects, "Bus listener started");

        loop {
            let subjects: Vec<&str> = self.subjects.iter().map(String::as_str).collect();

            let subscribed = tokio::select! {
                _ = self.shutdown.recv() => break,
                result = self.event_bus.subscribe(&subjects) => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    info!(
                        listener = %self.name,
                        subjects = ?self.subjects,
                        "Subscribed to event bus"
                    );
                    match self.process_stream(&mut stream).await? {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Disconnected => warn!(
                            listener = %self.name,
                            "Event stream ended, resubscribing in {:?}",
                            self.retry_delay
                        ),
                    }
                }
                Err(e) => error!(
                    listener = %self.name,
                    error = %e,
                    "Failed to subscribe to event bus, retrying in {:?}",
                    self.retry_delay
                ),
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(listener = %self.name, "Bus listener stopped");
        Ok(())
    }

    async fn process_stream(
        &mut self,
        stream: &mut MessageStream,
    ) -> Result<StreamEnd, PipelineError> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(listener = %self.name, "Shutdown signal received");
                    return Ok(StreamEnd::Shutdown);
                }
                next = stream.next() => match next {
                    Some(Ok(Received { message, ack })) => {
                        if let Err(e) = self.handler.handle(&message).await {
                            error!(
                                listener = %self.name,
                                subject = %message.subject,
                                stage = %e.stage(),
                                error = %e,
                                "Handler failed, stopping listener"
                            );
                            return Err(e);
                        }
                        ack.ack();
                    }
                    Some(Err(e)) => {
                        RelayMetrics::record_message(MessageOutcome::StreamError);
                        error!(
                            listener = %self.name,
                            error = %e,
                            "Error receiving message from bus"
                        );
                    }
                    None => return Ok(StreamEnd::Disconnected),
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relay_core::event_bus::EventBusError;
    use relay_core::event_store::StorageError;
    use relay_testing::{InMemoryEventBus, eventually};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<BusMessage>>,
        fail_on: Option<Vec<u8>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: &BusMessage) -> Result<(), PipelineError> {
            self.seen.lock().unwrap().push(message.clone());
            if self.fail_on.as_deref() == Some(message.payload.as_slice()) {
                return Err(PipelineError::Persist(StorageError::Connection("down".to_string())));
            }
            Ok(())
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    fn listener(
        bus: &InMemoryEventBus,
        handler: Arc<Recorder>,
    ) -> (BusListener, broadcast::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let listener = BusListener::new(
            "test",
            vec!["customer.registered".to_string()],
            Arc::new(bus.clone()),
            handler,
            shutdown_rx,
        )
        .with_retry_delay(Duration::from_millis(20));
        (listener, shutdown_tx)
    }

    #[tokio::test]
    async fn handles_messages_in_order_until_shutdown() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder::default());
        let (listener, shutdown) = listener(&bus, handler.clone());
        let task = listener.spawn();

        for body in [b"1", b"2", b"3"] {
            bus.publish("customer.registered", body).await.unwrap();
        }
        assert!(eventually(Duration::from_secs(2), || handler.count() == 3).await);

        shutdown.send(()).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
        let payloads: Vec<Vec<u8>> =
            handler.seen.lock().unwrap().iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert_eq!(bus.acknowledged(), bus.published());
    }

    #[tokio::test]
    async fn resubscribes_after_the_stream_ends() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder::default());
        let (listener, shutdown) = listener(&bus, handler.clone());
        let task = listener.spawn();

        assert!(eventually(Duration::from_secs(2), || bus.subscription_count() == 1).await);
        bus.disconnect_all();
        bus.publish("customer.registered", b"after").await.unwrap();

        assert!(eventually(Duration::from_secs(2), || handler.count() == 1).await);
        shutdown.send(()).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn stream_errors_do_not_stop_the_listener() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder::default());
        let (listener, shutdown) = listener(&bus, handler.clone());
        let task = listener.spawn();

        assert!(eventually(Duration::from_secs(2), || bus.subscription_count() == 1).await);
        bus.inject_error(&EventBusError::TransportError("broker hiccup".to_string()));
        bus.publish("customer.registered", b"next").await.unwrap();

        assert!(eventually(Duration::from_secs(2), || handler.count() == 1).await);
        shutdown.send(()).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn handler_error_stops_the_listener() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder {
            fail_on: Some(b"bad".to_vec()),
            ..Recorder::default()
        });
        let (listener, _shutdown) = listener(&bus, handler.clone());
        let task = listener.spawn();

        bus.publish("customer.registered", b"bad").await.unwrap();
        bus.publish("customer.registered", b"never handled").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listener stops")
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Persist(_))));
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn failed_message_and_those_behind_it_stay_unacknowledged() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder {
            fail_on: Some(b"bad".to_vec()),
            ..Recorder::default()
        });
        for body in [&b"good"[..], b"bad", b"buffered"] {
            bus.publish("customer.registered", body).await.unwrap();
        }
        let (listener, _shutdown) = listener(&bus, handler.clone());

        let result = tokio::time::timeout(Duration::from_secs(2), listener.run())
            .await
            .expect("listener stops");

        assert!(result.is_err());
        let acked: Vec<Vec<u8>> = bus.acknowledged().into_iter().map(|m| m.payload).collect();
        assert_eq!(acked, vec![b"good".to_vec()]);
    }
}
