//! Event store trait and storage errors.
//!
//! The event store records every successfully decoded bus message as an
//! immutable [`StoredEvent`]. It is append-only: rows are never updated or
//! deleted by the relay.
//!
//! # Duplicates
//!
//! `persist` is an unconditional insert. The bus delivers at-least-once, so a
//! redelivered message produces a second row (and a second notification).
//! There is no idempotency key at this boundary.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `relay-postgres`): production storage
//! - `InMemoryEventStore` (in `relay-testing`): fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use relay_core::event::DomainEvent;
//! use relay_core::event_store::{EventStore, StorageError};
//!
//! async fn example<S: EventStore>(store: &S, event: DomainEvent) -> Result<(), StorageError> {
//!     let stored = store.persist(event).await?;
//!     println!("stored {stored}");
//!     Ok(())
//! }
//! ```

use crate::event::{DomainEvent, StoredEvent};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by the persistence layer.
///
/// Shared by the event store, the subscriber registry and the dead-letter queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Could not reach the database or acquire a connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A constraint rejected the write.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// A stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Append-only store for domain events.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as
/// `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Persist a domain event as a new row.
    ///
    /// The insert is atomic: either the full row exists afterwards or nothing
    /// was written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on connection loss, query failure or
    /// constraint violation.
    fn persist(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEvent, StorageError>> + Send + '_>>;

    /// Number of stored events.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the count query fails.
    fn count(&self) -> Pin<Box<dyn Future<Output = Result<i64, StorageError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display() {
        let error = StorageError::Connection("pool timed out".to_string());
        assert_eq!(format!("{error}"), "Connection error: pool timed out");
    }
}
