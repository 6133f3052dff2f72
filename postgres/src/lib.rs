//! `PostgreSQL` storage for the notification relay.
//!
//! This crate implements the storage capabilities of `relay-core` on top of
//! a shared `sqlx` connection pool:
//!
//! - [`PostgresEventStore`]: append-only `events` table
//! - [`PostgresSubscriberRegistry`]: `subscribers` table, unique on `chat_id`
//! - [`DeadLetterQueue`]: `failed_messages` table
//!
//! Schema changes live in `migrations/` and are applied with [`migrate`].
//!
//! # Example
//!
//! ```ignore
//! use relay_postgres::{PoolSettings, PostgresEventStore, connect, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/relay", &PoolSettings::default()).await?;
//!     migrate(&pool).await?;
//!     let store = PostgresEventStore::from_pool(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;
mod event_store;
mod registry;

pub use dead_letter_queue::DeadLetterQueue;
pub use event_store::PostgresEventStore;
pub use registry::PostgresSubscriberRegistry;

use relay_core::event_store::StorageError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// How long to wait for a connection before giving up.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StorageError::Connection`] if the database cannot be reached.
pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<PgPool, StorageError> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(|e| StorageError::Connection(format!("Failed to connect: {e}")))
}

/// Apply the bundled migrations.
///
/// Safe to run on every start; applied migrations are skipped.
///
/// # Errors
///
/// Returns [`StorageError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StorageError::Database(format!("Migration failed: {e}")))?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Map a `sqlx` error onto the storage taxonomy.
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> StorageError {
    match error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Connection(error.to_string()),
        sqlx::Error::Database(db)
            if db.is_unique_violation()
                || db.is_foreign_key_violation()
                || db.is_check_violation() =>
        {
            StorageError::Constraint(db.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StorageError::Serialization(error.to_string())
        }
        other => StorageError::Database(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_connection_errors() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            StorageError::Connection(_)
        ));
    }

    #[test]
    fn missing_rows_are_database_errors() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            StorageError::Database(_)
        ));
    }

    #[test]
    fn default_pool_settings() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_connections, 10);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(30));
    }
}
