//! Append-only event store over the `events` table.

use crate::map_sqlx_error;
use chrono::{DateTime, Utc};
use relay_core::event::{DomainEvent, StoredEvent};
use relay_core::event_store::{EventStore, StorageError};
use sqlx::PgPool;
use sqlx::types::Json;
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-backed [`EventStore`].
///
/// Every call to `persist` inserts exactly one row. Nothing deduplicates
/// redelivered bus messages, so a redelivery stores a second row.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl EventStore for PostgresEventStore {
    fn persist(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEvent, StorageError>> + Send + '_>> {
        Box::pin(async move {
            let (id, created_at, updated_at, deleted_at): (
                i64,
                DateTime<Utc>,
                DateTime<Utc>,
                Option<DateTime<Utc>>,
            ) = sqlx::query_as(
                r"
                INSERT INTO events (subject, payload)
                VALUES ($1, $2)
                RETURNING id, created_at, updated_at, deleted_at
                ",
            )
            .bind(&event.subject)
            .bind(Json(&event.payload))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            tracing::debug!(stored_event_id = id, subject = %event.subject, "Event inserted");
            metrics::counter!("relay_postgres_events_inserted_total").increment(1);

            Ok(StoredEvent {
                id,
                subject: event.subject,
                payload: event.payload,
                created_at,
                updated_at,
                deleted_at,
            })
        })
    }

    fn count(&self) -> Pin<Box<dyn Future<Output = Result<i64, StorageError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            Ok(count)
        })
    }
}
