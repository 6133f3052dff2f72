//! Fanout of a rendered notification to every subscriber.
//!
//! The dispatcher reads a fresh subscriber snapshot on every call and sends
//! the same text to each recipient. Recipients are independent: one blocked
//! chat or rate-limited send never prevents delivery to the others. Failed
//! sends are reported, not retried.

use crate::metrics::RelayMetrics;
use futures::{StreamExt, TryStreamExt};
use relay_core::event_store::StorageError;
use relay_core::registry::{ChatId, SubscriberRegistry};
use relay_core::transport::{ChatTransport, DeliveryError};
use std::sync::Arc;

/// Default number of sends in flight at once.
pub const DEFAULT_MAX_CONCURRENT_SENDS: usize = 8;

/// A recipient that could not be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Recipient chat.
    pub recipient: ChatId,
    /// Why the send failed.
    pub error: DeliveryError,
}

/// Result of one fanout.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipients a send was attempted for.
    pub attempted: usize,
    /// Recipients the transport accepted the message for.
    pub delivered: usize,
    /// Per-recipient failures.
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    /// Whether every attempted send succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Sends one text to all current subscribers.
pub struct FanoutDispatcher {
    registry: Arc<dyn SubscriberRegistry>,
    transport: Arc<dyn ChatTransport>,
    max_concurrent_sends: usize,
}

impl FanoutDispatcher {
    /// Create a dispatcher with [`DEFAULT_MAX_CONCURRENT_SENDS`].
    #[must_use]
    pub fn new(registry: Arc<dyn SubscriberRegistry>, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            registry,
            transport,
            max_concurrent_sends: DEFAULT_MAX_CONCURRENT_SENDS,
        }
    }

    /// Bound the number of concurrent sends (at least one).
    #[must_use]
    pub fn with_max_concurrent_sends(mut self, max: usize) -> Self {
        self.max_concurrent_sends = max.max(1);
        self
    }

    /// Deliver `text` to every subscriber in the current snapshot.
    ///
    /// The snapshot is read in full before the first send, so a storage
    /// failure means nobody was messaged.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] only when the subscriber snapshot cannot be
    /// read. Delivery failures are reported in the [`DeliveryReport`].
    pub async fn dispatch(&self, text: &str) -> Result<DeliveryReport, StorageError> {
        let recipients: Vec<ChatId> = self
            .registry
            .list_all()
            .map_ok(|subscriber| subscriber.chat_id)
            .try_collect()
            .await?;

        let transport = &self.transport;
        let results: Vec<(ChatId, Result<(), DeliveryError>)> = futures::stream::iter(recipients)
            .map(|recipient| async move { (recipient, transport.send_text(recipient, text).await) })
            .buffer_unordered(self.max_concurrent_sends)
            .collect()
            .await;

        let mut report = DeliveryReport {
            attempted: results.len(),
            ..DeliveryReport::default()
        };
        for (recipient, result) in results {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    RelayMetrics::record_delivery(true);
                }
                Err(error) => {
                    tracing::warn!(chat_id = %recipient, error = %error, "Delivery failed");
                    RelayMetrics::record_delivery(false);
                    report.failures.push(DeliveryFailure { recipient, error });
                }
            }
        }

        tracing::debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failures.len(),
            "Fanout complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use relay_testing::{InMemorySubscriberRegistry, RecordingTransport};

    fn dispatcher(
        registry: &InMemorySubscriberRegistry,
        transport: &RecordingTransport,
    ) -> FanoutDispatcher {
        FanoutDispatcher::new(Arc::new(registry.clone()), Arc::new(transport.clone()))
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let registry = InMemorySubscriberRegistry::with_subscribers([1, 2, 3]);
        let transport = RecordingTransport::new();

        let report = dispatcher(&registry, &transport).dispatch("hello").await.unwrap();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 3);
        assert!(report.is_complete());
        let mut recipients: Vec<i64> = transport.sent().iter().map(|(c, _)| c.0).collect();
        recipients.sort_unstable();
        assert_eq!(recipients, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_others() {
        let registry = InMemorySubscriberRegistry::with_subscribers(1..=5);
        let transport = RecordingTransport::new();
        transport.fail_for(ChatId(3), DeliveryError::Forbidden("bot was blocked".to_string()));

        let report = dispatcher(&registry, &transport).dispatch("hello").await.unwrap();

        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 4);
        assert_eq!(
            report.failures,
            vec![DeliveryFailure {
                recipient: ChatId(3),
                error: DeliveryError::Forbidden("bot was blocked".to_string()),
            }]
        );
        assert_eq!(transport.attempts(), 5);
    }

    #[tokio::test]
    async fn no_subscribers_sends_nothing() {
        let registry = InMemorySubscriberRegistry::new();
        let transport = RecordingTransport::new();

        let report = dispatcher(&registry, &transport).dispatch("hello").await.unwrap();

        assert_eq!(report, DeliveryReport::default());
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn unreadable_snapshot_is_a_storage_error() {
        let registry = InMemorySubscriberRegistry::with_subscribers([1]);
        registry.fail_listing_with(StorageError::Connection("pool closed".to_string()));
        let transport = RecordingTransport::new();

        let result = dispatcher(&registry, &transport).dispatch("hello").await;

        assert_eq!(result, Err(StorageError::Connection("pool closed".to_string())));
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn sees_subscribers_added_between_dispatches() {
        let registry = InMemorySubscriberRegistry::new();
        let transport = RecordingTransport::new();
        let dispatcher = dispatcher(&registry, &transport).with_max_concurrent_sends(1);

        dispatcher.dispatch("first").await.unwrap();
        registry.register_if_absent(ChatId(9)).await.unwrap();
        let report = dispatcher.dispatch("second").await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(transport.sent_to(ChatId(9)), vec!["second".to_string()]);
    }
}
