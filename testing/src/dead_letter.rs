//! In-memory dead-letter queue.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use crate::mocks::test_clock;
use relay_core::dead_letter::{DeadLetter, DeadLetterSink, DeadLetterStatus, Stage};
use relay_core::environment::Clock;
use relay_core::event_bus::BusMessage;
use relay_core::event_store::StorageError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

/// Dead-letter queue kept in a `Vec`.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterQueue {
    entries: Arc<RwLock<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stages of all entries, in order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.stage)
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    fn record<'a>(
        &'a self,
        message: &'a BusMessage,
        stage: Stage,
        error_message: &'a str,
        error_details: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            #[allow(clippy::cast_possible_wrap)]
            let id = entries.len() as i64 + 1;
            entries.push(DeadLetter {
                id,
                subject: message.subject.clone(),
                payload: message.payload.clone(),
                stage,
                error_message: error_message.to_string(),
                error_details: error_details.map(str::to_string),
                failed_at: test_clock().now(),
                status: DeadLetterStatus::Pending,
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
            });
            Ok(id)
        })
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StorageError>> + Send + '_>> {
        Box::pin(async move {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            #[allow(clippy::cast_possible_wrap)]
            let pending = entries
                .iter()
                .filter(|e| e.status == DeadLetterStatus::Pending)
                .count() as i64;
            Ok(pending)
        })
    }
}
