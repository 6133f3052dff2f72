//! Dead Letter Queue (DLQ) for failed bus messages.
//!
//! Keeps the raw payload of every message the pipeline gave up on, with the
//! stage that failed, so an operator can investigate and then resolve or
//! discard the entry.

use crate::map_sqlx_error;
use relay_core::dead_letter::{DeadLetter, DeadLetterSink, DeadLetterStatus, Stage};
use relay_core::event_bus::BusMessage;
use relay_core::event_store::StorageError;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

const COLUMNS: &str = "id, subject, payload, stage, error_message, error_details, failed_at, \
                       status, resolved_at, resolved_by, resolution_notes";

/// `PostgreSQL`-based dead-letter queue.
///
/// # Example
///
/// ```no_run
/// use relay_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// if let Some(entry) = pending.first() {
///     dlq.mark_discarded(entry.id, "malformed payload, reported upstream").await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a queue over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a failed message.
    ///
    /// # Returns
    ///
    /// The id of the new entry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the insert fails.
    pub async fn add_entry(
        &self,
        message: &BusMessage,
        stage: Stage,
        error_message: &str,
        error_details: Option<&str>,
    ) -> Result<i64, StorageError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_messages (subject, payload, stage, error_message, error_details)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(&message.subject)
        .bind(&message.payload)
        .bind(stage.as_str())
        .bind(error_message)
        .bind(error_details)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        tracing::warn!(
            dlq_id = id,
            subject = %message.subject,
            stage = %stage,
            error = error_message,
            "Message added to Dead Letter Queue"
        );

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetter>, StorageError> {
        self.list_by_status(DeadLetterStatus::Pending, limit).await
    }

    /// List entries with the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, StorageError> {
        #[allow(clippy::cast_possible_wrap)] // Limits are small
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM failed_messages \
             WHERE status = $1 ORDER BY failed_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    /// Get one entry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the query fails or the entry does not exist.
    pub async fn get_by_id(&self, id: i64) -> Result<DeadLetter, StorageError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM failed_messages WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Self::row_to_dead_letter(&row)
    }

    /// Mark an entry as resolved.
    ///
    /// # Arguments
    ///
    /// * `id` - The entry id
    /// * `resolved_by` - Who resolved it
    /// * `notes` - What was done
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("relay_dead_letters_resolved_total").increment(1);

        Ok(())
    }

    /// Mark an entry as permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StorageError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");
        metrics::counter!("relay_dead_letters_discarded_total").increment(1);

        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the query fails.
    pub async fn pending_count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(count)
    }

    fn row_to_dead_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, StorageError> {
        let stage: String = row.try_get("stage").map_err(map_sqlx_error)?;
        let status: String = row.try_get("status").map_err(map_sqlx_error)?;

        Ok(DeadLetter {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            subject: row.try_get("subject").map_err(map_sqlx_error)?,
            payload: row.try_get("payload").map_err(map_sqlx_error)?,
            stage: stage.parse()?,
            error_message: row.try_get("error_message").map_err(map_sqlx_error)?,
            error_details: row.try_get("error_details").map_err(map_sqlx_error)?,
            failed_at: row.try_get("failed_at").map_err(map_sqlx_error)?,
            status: status.parse()?,
            resolved_at: row.try_get("resolved_at").map_err(map_sqlx_error)?,
            resolved_by: row.try_get("resolved_by").map_err(map_sqlx_error)?,
            resolution_notes: row.try_get("resolution_notes").map_err(map_sqlx_error)?,
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn record<'a>(
        &'a self,
        message: &'a BusMessage,
        stage: Stage,
        error_message: &'a str,
        error_details: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StorageError>> + Send + 'a>> {
        Box::pin(self.add_entry(message, stage, error_message, error_details))
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StorageError>> + Send + '_>> {
        Box::pin(self.pending_count())
    }
}
