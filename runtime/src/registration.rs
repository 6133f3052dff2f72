//! Chat registration listener.
//!
//! Runs next to the bus listener and consumes inbound bot commands. A `start`
//! command registers the chat as a subscriber (idempotently) and answers with
//! the `subscription_success` template. The confirmation goes to that chat
//! only; it is not a fanout.
//!
//! Failures are per command: they are logged and the loop keeps running.
//! Each command is acknowledged once handled, failed or not; commands still
//! queued at shutdown are not, so the chat service offers them again.

use crate::metrics::RelayMetrics;
use crate::renderer::{RenderError, SUBSCRIPTION_SUCCESS, TemplateRenderer};
use futures::StreamExt;
use relay_core::ack::Received;
use relay_core::event_store::StorageError;
use relay_core::registry::{Subscriber, SubscriberRegistry};
use relay_core::transport::{
    ChatCommand, ChatTransport, CommandSource, CommandStream, DeliveryError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Command that subscribes a chat.
pub const START_COMMAND: &str = "start";

/// Failure while handling a single command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The subscriber could not be stored.
    #[error("Registration failed: {0}")]
    Storage(#[from] StorageError),

    /// The confirmation could not be rendered.
    #[error("Confirmation render failed: {0}")]
    Render(#[from] RenderError),

    /// The confirmation could not be sent.
    #[error("Confirmation delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Long-running consumer of chat commands.
pub struct RegistrationListener {
    source: Arc<dyn CommandSource>,
    registry: Arc<dyn SubscriberRegistry>,
    transport: Arc<dyn ChatTransport>,
    renderer: Arc<TemplateRenderer>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
}

impl RegistrationListener {
    /// Create a listener retrying the command source every 5 seconds.
    #[must_use]
    pub fn new(
        source: Arc<dyn CommandSource>,
        registry: Arc<dyn SubscriberRegistry>,
        transport: Arc<dyn ChatTransport>,
        renderer: Arc<TemplateRenderer>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            source,
            registry,
            transport,
            renderer,
            shutdown,
            retry_delay: crate::consumer::DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the delay before reopening the command stream.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Spawn the listener as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until a shutdown signal is received.
    pub async fn run(mut self) {
        info!("Registration listener started");

        loop {
            let opened = tokio::select! {
                _ = self.shutdown.recv() => break,
                result = self.source.commands() => result,
            };

            match opened {
                Ok(mut commands) => {
                    if self.process_commands(&mut commands).await {
                        break;
                    }
                    warn!("Command stream ended, reopening in {:?}", self.retry_delay);
                }
                Err(e) => error!(
                    error = %e,
                    "Failed to open command stream, retrying in {:?}",
                    self.retry_delay
                ),
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!("Registration listener stopped");
    }

    /// Returns `true` on shutdown, `false` when the stream ended.
    async fn process_commands(&mut self, commands: &mut CommandStream) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return true,
                next = commands.next() => match next {
                    Some(Ok(Received { message: command, ack })) => {
                        // Errors are already logged per command.
                        let _ = self.handle_command(&command).await;
                        ack.ack();
                    }
                    Some(Err(e)) => warn!(error = %e, "Error receiving chat command"),
                    None => return false,
                },
            }
        }
    }

    /// Handle one command.
    ///
    /// Returns the subscriber for `start`, `None` for any other command.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] if registering, rendering or sending the
    /// confirmation fails. A subscriber stored before a render or delivery
    /// failure stays registered.
    pub async fn handle_command(
        &self,
        command: &ChatCommand,
    ) -> Result<Option<Subscriber>, RegistrationError> {
        if command.command != START_COMMAND {
            debug!(chat_id = %command.chat_id, command = %command.command, "Ignoring command");
            return Ok(None);
        }

        let result = self.register(command).await;
        match &result {
            Ok(subscriber) => {
                RelayMetrics::record_registration();
                info!(
                    chat_id = %subscriber.chat_id,
                    subscriber_id = subscriber.id,
                    "Chat subscribed"
                );
            }
            Err(e) => error!(chat_id = %command.chat_id, error = %e, "Registration failed"),
        }
        result.map(Some)
    }

    async fn register(&self, command: &ChatCommand) -> Result<Subscriber, RegistrationError> {
        let subscriber = self.registry.register_if_absent(command.chat_id).await?;
        let text = self
            .renderer
            .render(SUBSCRIPTION_SUCCESS, &BTreeMap::new())
            .await?;
        self.transport.send_text(subscriber.chat_id, &text).await?;
        Ok(subscriber)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relay_core::registry::ChatId;
    use relay_testing::{
        InMemorySubscriberRegistry, RecordingTransport, ScriptedCommandSource, eventually,
    };
    use std::fs;

    struct Harness {
        _templates: tempfile::TempDir,
        source: ScriptedCommandSource,
        registry: InMemorySubscriberRegistry,
        transport: RecordingTransport,
        shutdown: broadcast::Sender<()>,
        listener: RegistrationListener,
    }

    fn harness(with_template: bool) -> Harness {
        let templates = tempfile::tempdir().expect("tempdir");
        if with_template {
            fs::write(templates.path().join("subscription_success.md"), "Subscribed\\.")
                .expect("template");
        }
        let source = ScriptedCommandSource::new();
        let registry = InMemorySubscriberRegistry::new();
        let transport = RecordingTransport::new();
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        let listener = RegistrationListener::new(
            Arc::new(source.clone()),
            Arc::new(registry.clone()),
            Arc::new(transport.clone()),
            Arc::new(TemplateRenderer::new(templates.path()).expect("renderer")),
            shutdown_rx,
        )
        .with_retry_delay(Duration::from_millis(20));

        Harness {
            _templates: templates,
            source,
            registry,
            transport,
            shutdown,
            listener,
        }
    }

    fn start(chat_id: i64) -> ChatCommand {
        ChatCommand::parse(ChatId(chat_id), "/start").expect("command")
    }

    #[tokio::test]
    async fn start_registers_and_confirms() {
        let h = harness(true);

        let subscriber = h.listener.handle_command(&start(42)).await.unwrap();

        assert_eq!(subscriber.map(|s| s.chat_id), Some(ChatId(42)));
        assert_eq!(h.registry.chat_ids(), vec![ChatId(42)]);
        assert_eq!(h.transport.sent(), vec![(ChatId(42), "Subscribed\\.".to_string())]);
    }

    #[tokio::test]
    async fn start_twice_keeps_one_subscriber_and_confirms_twice() {
        let h = harness(true);

        let first = h.listener.handle_command(&start(42)).await.unwrap();
        let second = h.listener.handle_command(&start(42)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.transport.sent_to(ChatId(42)).len(), 2);
    }

    #[tokio::test]
    async fn other_commands_are_ignored() {
        let h = harness(true);
        let help = ChatCommand::parse(ChatId(42), "/help").expect("command");

        assert_eq!(h.listener.handle_command(&help).await, Ok(None));
        assert!(h.registry.is_empty());
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test]
    async fn missing_template_keeps_the_registration() {
        let h = harness(false);

        let err = h.listener.handle_command(&start(42)).await.unwrap_err();

        assert!(matches!(err, RegistrationError::Render(_)));
        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test]
    async fn blocked_chat_is_reported() {
        let h = harness(true);
        h.transport
            .fail_for(ChatId(42), DeliveryError::Forbidden("bot was blocked".to_string()));

        let err = h.listener.handle_command(&start(42)).await.unwrap_err();

        assert!(matches!(err, RegistrationError::Delivery(_)));
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test]
    async fn loop_survives_failing_commands() {
        let h = harness(true);
        h.transport
            .fail_for(ChatId(1), DeliveryError::ChatNotFound("chat not found".to_string()));
        let task = h.listener.spawn();

        h.source.send_text(1, "/start");
        h.source.send_text(2, "hello there");
        h.source.send_text(3, "/start@relay_bot");

        let transport = h.transport.clone();
        assert!(eventually(Duration::from_secs(2), || transport.sent().len() == 1).await);
        assert_eq!(h.transport.sent_to(ChatId(3)).len(), 1);
        assert_eq!(h.registry.chat_ids(), vec![ChatId(1), ChatId(3)]);
        let source = h.source.clone();
        assert!(eventually(Duration::from_secs(2), || source.acknowledged().len() == 2).await);

        h.shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listener stops")
            .unwrap();
    }
}
