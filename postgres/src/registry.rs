//! Subscriber registry over the `subscribers` table.

use crate::map_sqlx_error;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use relay_core::event_store::StorageError;
use relay_core::registry::{ChatId, Subscriber, SubscriberRegistry, SubscriberStream};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;

type SubscriberRow = (i64, i64, DateTime<Utc>, DateTime<Utc>, Option<DateTime<Utc>>);

fn to_subscriber((id, chat_id, created_at, updated_at, deleted_at): SubscriberRow) -> Subscriber {
    Subscriber {
        id,
        chat_id: ChatId(chat_id),
        created_at,
        updated_at,
        deleted_at,
    }
}

/// `PostgreSQL`-backed [`SubscriberRegistry`].
///
/// Registration relies on the unique constraint on `chat_id`: the insert is
/// `ON CONFLICT DO NOTHING` and the existing row is selected when the insert
/// was skipped, so concurrent registrations of one chat never fail.
#[derive(Clone)]
pub struct PostgresSubscriberRegistry {
    pool: PgPool,
}

impl PostgresSubscriberRegistry {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find(&self, chat_id: ChatId) -> Result<Option<Subscriber>, StorageError> {
        let row: Option<SubscriberRow> = sqlx::query_as(
            r"
            SELECT id, chat_id, created_at, updated_at, deleted_at
            FROM subscribers
            WHERE chat_id = $1
            ",
        )
        .bind(chat_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(to_subscriber))
    }
}

impl SubscriberRegistry for PostgresSubscriberRegistry {
    fn register_if_absent(
        &self,
        chat_id: ChatId,
    ) -> Pin<Box<dyn Future<Output = Result<Subscriber, StorageError>> + Send + '_>> {
        Box::pin(async move {
            let inserted: Option<SubscriberRow> = sqlx::query_as(
                r"
                INSERT INTO subscribers (chat_id)
                VALUES ($1)
                ON CONFLICT (chat_id) DO NOTHING
                RETURNING id, chat_id, created_at, updated_at, deleted_at
                ",
            )
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            if let Some(row) = inserted {
                let subscriber = to_subscriber(row);
                tracing::debug!(
                    chat_id = %chat_id,
                    subscriber_id = subscriber.id,
                    "Subscriber inserted"
                );
                return Ok(subscriber);
            }

            self.find(chat_id).await?.ok_or_else(|| {
                StorageError::Database(format!("Subscriber {chat_id} vanished after conflict"))
            })
        })
    }

    fn list_all(&self) -> SubscriberStream<'_> {
        Box::pin(
            sqlx::query_as::<_, SubscriberRow>(
                r"
                SELECT id, chat_id, created_at, updated_at, deleted_at
                FROM subscribers
                ORDER BY id
                ",
            )
            .fetch(&self.pool)
            .map_ok(to_subscriber)
            .map_err(map_sqlx_error),
        )
    }
}
