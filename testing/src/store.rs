//! In-memory event store and subscriber registry.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use crate::mocks::test_clock;
use relay_core::environment::Clock;
use relay_core::event::{DomainEvent, StoredEvent};
use relay_core::event_store::{EventStore, StorageError};
use relay_core::registry::{ChatId, Subscriber, SubscriberRegistry, SubscriberStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// In-memory, append-only event store.
///
/// [`fail_with`](Self::fail_with) makes every following `persist` return the
/// given error until [`recover`](Self::recover) is called.
#[derive(Clone)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<StoredEvent>>>,
    failure: Arc<Mutex<Option<StorageError>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventStore {
    /// Create an empty store stamped by [`test_clock`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Create an empty store stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
            clock,
        }
    }

    /// Make `persist` fail with `error`.
    pub fn fail_with(&self, error: StorageError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Stop injecting failures.
    pub fn recover(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Snapshot of the stored events.
    #[must_use]
    pub fn events(&self) -> Vec<StoredEvent> {
        self.events.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn persist(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEvent, StorageError>> + Send + '_>> {
        Box::pin(async move {
            let failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(error) = failure {
                return Err(error);
            }

            let now = self.clock.now();
            let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
            #[allow(clippy::cast_possible_wrap)] // Test stores stay small
            let stored = StoredEvent {
                id: events.len() as i64 + 1,
                subject: event.subject,
                payload: event.payload,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            events.push(stored.clone());
            Ok(stored)
        })
    }

    fn count(&self) -> Pin<Box<dyn Future<Output = Result<i64, StorageError>> + Send + '_>> {
        #[allow(clippy::cast_possible_wrap)]
        let count = self.len() as i64;
        Box::pin(async move { Ok(count) })
    }
}

/// In-memory subscriber registry.
///
/// [`fail_listing_with`](Self::fail_listing_with) makes `list_all` yield a
/// single error, which is how an unreadable snapshot looks to the dispatcher.
#[derive(Clone)]
pub struct InMemorySubscriberRegistry {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    list_failure: Arc<Mutex<Option<StorageError>>>,
    clock: Arc<dyn Clock>,
}

impl InMemorySubscriberRegistry {
    /// Create an empty registry stamped by [`test_clock`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            list_failure: Arc::new(Mutex::new(None)),
            clock: Arc::new(test_clock()),
        }
    }

    /// Create a registry already holding `chat_ids`.
    #[must_use]
    pub fn with_subscribers(chat_ids: impl IntoIterator<Item = i64>) -> Self {
        let registry = Self::new();
        for chat_id in chat_ids {
            registry.add(ChatId(chat_id));
        }
        registry
    }

    /// Make `list_all` fail with `error`.
    pub fn fail_listing_with(&self, error: StorageError) {
        *self.list_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Registered chat ids, in registration order.
    #[must_use]
    pub fn chat_ids(&self) -> Vec<ChatId> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.chat_id)
            .collect()
    }

    /// Number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Register `chat_id` synchronously, returning the existing row if any.
    pub fn add(&self, chat_id: ChatId) -> Subscriber {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = subscribers.iter().find(|s| s.chat_id == chat_id) {
            return existing.clone();
        }

        let now = self.clock.now();
        #[allow(clippy::cast_possible_wrap)]
        let subscriber = Subscriber {
            id: subscribers.len() as i64 + 1,
            chat_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        subscribers.push(subscriber.clone());
        subscriber
    }
}

impl Default for InMemorySubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry for InMemorySubscriberRegistry {
    fn register_if_absent(
        &self,
        chat_id: ChatId,
    ) -> Pin<Box<dyn Future<Output = Result<Subscriber, StorageError>> + Send + '_>> {
        Box::pin(async move { Ok(self.add(chat_id)) })
    }

    fn list_all(&self) -> SubscriberStream<'_> {
        let items: Vec<Result<Subscriber, StorageError>> =
            match self.list_failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
                Some(error) => vec![Err(error)],
                None => self
                    .subscribers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .cloned()
                    .map(Ok)
                    .collect(),
            };
        Box::pin(futures::stream::iter(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use relay_core::event::DomainEvent;

    #[tokio::test]
    async fn persist_assigns_sequential_ids() {
        let store = InMemoryEventStore::new();
        let first = store
            .persist(DomainEvent::new("customer.registered", crate::fixtures::ana()))
            .await
            .unwrap();
        let second = store
            .persist(DomainEvent::new("customer.registered", crate::fixtures::ana()))
            .await
            .unwrap();

        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(first.created_at, test_clock().now());
    }

    #[tokio::test]
    async fn injected_failure_stores_nothing() {
        let store = InMemoryEventStore::new();
        store.fail_with(StorageError::Connection("down".to_string()));

        let result = store
            .persist(DomainEvent::new("customer.registered", crate::fixtures::ana()))
            .await;

        assert_eq!(result, Err(StorageError::Connection("down".to_string())));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn registering_twice_keeps_one_subscriber() {
        let registry = InMemorySubscriberRegistry::new();
        let first = registry.register_if_absent(ChatId(42)).await.unwrap();
        let second = registry.register_if_absent(ChatId(42)).await.unwrap();

        assert_eq!(first, second);
        let all: Vec<Subscriber> = registry.list_all().try_collect().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn listing_failure_is_yielded() {
        let registry = InMemorySubscriberRegistry::with_subscribers([1, 2]);
        registry.fail_listing_with(StorageError::Database("gone".to_string()));

        let result: Result<Vec<Subscriber>, _> = registry.list_all().try_collect().await;
        assert!(result.is_err());
    }
}
