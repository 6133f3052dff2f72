//! Subscriber registry.
//!
//! The registry is the set of chat recipients that receive notifications.
//! Registration is idempotent and the relay never removes anyone.
//!
//! Reads are never cached: every fanout calls [`SubscriberRegistry::list_all`]
//! and so sees registrations made right before it.

use crate::event_store::StorageError;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Identifier of a chat recipient on the chat transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered notification recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscriber {
    /// Storage identity.
    pub id: i64,

    /// Chat recipient, unique across the registry.
    pub chat_id: ChatId,

    /// When the subscriber registered.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp (equal to `created_at` in practice).
    pub updated_at: DateTime<Utc>,

    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Lazy stream over a subscriber snapshot.
pub type SubscriberStream<'a> =
    Pin<Box<dyn Stream<Item = Result<Subscriber, StorageError>> + Send + 'a>>;

/// Registry of notification recipients.
pub trait SubscriberRegistry: Send + Sync {
    /// Register a chat recipient unless it is already registered.
    ///
    /// Always returns the subscriber row, whether it was just created or
    /// already existed. Registering twice never errors.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the registry cannot be read or written.
    fn register_if_absent(
        &self,
        chat_id: ChatId,
    ) -> Pin<Box<dyn Future<Output = Result<Subscriber, StorageError>> + Send + '_>>;

    /// Stream every subscriber as of the time of the call.
    ///
    /// The stream is finite. It cannot be restarted; call again to re-read.
    fn list_all(&self) -> SubscriberStream<'_>;
}
