//! Message bus abstraction.
//!
//! The relay consumes domain events published by other services. The bus is
//! treated as a capability that hands over opaque byte payloads tagged with
//! the subject they were published on:
//!
//! ```text
//! ┌──────────────┐   subject + bytes   ┌──────────────┐
//! │  Event Bus   │────────────────────►│ Bus Listener │
//! │ (Redpanda)   │  at-least-once      │  (pipeline)  │
//! └──────────────┘                     └──────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a message may be delivered more than once
//! - **Acknowledged after handling**: see [`crate::ack`]
//! - **No ordering across subjects**
//! - **Opaque payloads**: decoding is the subscriber's job
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (in `relay-testing`) - for tests
//! - `RedpandaEventBus` (in `relay-redpanda`) - Kafka-compatible, subject == topic

use crate::ack::Received;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a subject
    #[error("Publish failed for subject '{subject}': {reason}")]
    PublishFailed {
        /// The subject that failed
        subject: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to subjects
    #[error("Subscription failed for subjects {subjects:?}: {reason}")]
    SubscriptionFailed {
        /// The subjects that failed to subscribe
        subjects: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// A message arrived without a payload
    #[error("Empty message on subject '{0}'")]
    EmptyMessage(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// A raw message received from the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    /// Subject (routing key) the message was published on.
    pub subject: String,

    /// Raw message body.
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Create a new bus message.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BusMessage {{ subject: {}, size: {} bytes }}",
            self.subject,
            self.payload.len()
        )
    }
}

/// A bus message awaiting acknowledgement.
pub type ReceivedMessage = Received<BusMessage>;

/// Stream of messages from a subscription.
pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<ReceivedMessage, EventBusError>> + Send>>;

/// Trait for message bus implementations.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns keep the trait usable as
/// `Arc<dyn EventBus>`, which is how listeners hold it.
pub trait EventBus: Send + Sync {
    /// Publish a raw payload on a subject.
    ///
    /// The relay itself only consumes; publishing is used by the demo
    /// producer and by tests.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more subjects.
    ///
    /// The returned stream yields messages from all subjects with
    /// at-least-once semantics. A message is confirmed to the broker only
    /// after its [`Ack`](crate::ack::Ack) fires, and never ahead of an
    /// earlier message of the same subscription. Stream-level errors are
    /// yielded as items; the stream ending means the subscription was lost.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        subjects: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>>;
}
