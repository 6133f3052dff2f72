//! Recording chat transport and scripted command source.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use relay_core::ack::{Ack, Received};
use relay_core::registry::ChatId;
use relay_core::transport::{
    ChatCommand, ChatTransport, CommandSource, CommandStream, DeliveryError, ReceivedCommand,
    TransportError,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Chat transport that records every successful send.
///
/// Failures are injected per recipient with [`fail_for`](Self::fail_for);
/// failed sends are counted as attempts but not recorded as sent.
///
/// ```
/// use relay_core::registry::ChatId;
/// use relay_core::transport::{ChatTransport, DeliveryError};
/// use relay_testing::RecordingTransport;
///
/// # tokio_test::block_on(async {
/// let transport = RecordingTransport::new();
/// transport.fail_for(ChatId(2), DeliveryError::Forbidden("blocked".into()));
///
/// assert!(transport.send_text(ChatId(1), "hi").await.is_ok());
/// assert!(transport.send_text(ChatId(2), "hi").await.is_err());
/// assert_eq!(transport.sent(), vec![(ChatId(1), "hi".to_string())]);
/// assert_eq!(transport.attempts(), 2);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<(ChatId, String)>>>,
    failures: Arc<Mutex<HashMap<ChatId, DeliveryError>>>,
    attempts: Arc<Mutex<usize>>,
}

impl RecordingTransport {
    /// Create a transport that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send to `recipient` with `error`.
    pub fn fail_for(&self, recipient: ChatId, error: DeliveryError) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).insert(recipient, error);
    }

    /// Successful sends, in completion order.
    #[must_use]
    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Texts successfully sent to `recipient`.
    #[must_use]
    pub fn sent_to(&self, recipient: ChatId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(chat, _)| *chat == recipient)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Number of send attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChatTransport for RecordingTransport {
    fn send_text(
        &self,
        recipient: ChatId,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>> {
        let text = text.to_string();
        Box::pin(async move {
            *self.attempts.lock().unwrap_or_else(PoisonError::into_inner) += 1;
            let failure = self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&recipient)
                .cloned();
            if let Some(error) = failure {
                return Err(error);
            }
            self.sent.lock().unwrap_or_else(PoisonError::into_inner).push((recipient, text));
            Ok(())
        })
    }
}

type Item = Result<ChatCommand, TransportError>;

/// Command source fed by the test.
///
/// The first call to `commands` hands out the stream; later calls fail until
/// the source is dropped. The stream ends after [`close`](Self::close).
/// Fired acks are recorded and listed by [`acknowledged`](Self::acknowledged).
#[derive(Clone)]
pub struct ScriptedCommandSource {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Item>>>>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Item>>>>,
    acknowledged: Arc<Mutex<Vec<ChatCommand>>>,
}

impl ScriptedCommandSource {
    /// Create a source with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx: Arc::new(Mutex::new(Some(rx))),
            acknowledged: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Commands acknowledged so far, in ack order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<ChatCommand> {
        self.acknowledged.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Queue a command as plain message text from `chat_id`.
    ///
    /// Text that is not a command is dropped, as a real bot would.
    pub fn send_text(&self, chat_id: i64, text: &str) {
        if let Some(command) = ChatCommand::parse(ChatId(chat_id), text) {
            self.push(Ok(command));
        }
    }

    /// Queue a raw stream item.
    pub fn push(&self, item: Item) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = tx.send(item);
        }
    }

    /// End the command stream.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl Default for ScriptedCommandSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandSource for ScriptedCommandSource {
    fn commands(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<CommandStream, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let Some(mut rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
                return Err(TransportError::Polling(
                    "command stream already opened".to_string(),
                ));
            };

            let acknowledged = Arc::clone(&self.acknowledged);
            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item.map(|command| with_recorded_ack(&acknowledged, command));
                }
            };
            Ok(Box::pin(stream) as CommandStream)
        })
    }
}

fn with_recorded_ack(log: &Arc<Mutex<Vec<ChatCommand>>>, command: ChatCommand) -> ReceivedCommand {
    let log = Arc::clone(log);
    let acked = command.clone();
    Received::new(
        command,
        Ack::new(move || {
            log.lock().unwrap_or_else(PoisonError::into_inner).push(acked);
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn scripted_commands_flow_until_closed() {
        let source = ScriptedCommandSource::new();
        source.send_text(7, "/start");
        source.send_text(7, "hello");
        source.close();

        let commands: Vec<_> = source.commands().await.unwrap().collect().await;
        assert_eq!(commands.len(), 1);
        assert!(source.commands().await.is_err());
        assert!(source.acknowledged().is_empty());

        for received in commands {
            received.unwrap().ack.ack();
        }
        assert_eq!(source.acknowledged()[0].command, "start");
    }
}
