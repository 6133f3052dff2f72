//! Dead-letter records for bus messages that failed processing.
//!
//! Under the `Isolate` failure policy a message that fails to decode, persist,
//! render or dispatch is not dropped silently: the raw payload is written to
//! the dead-letter queue together with the stage that failed, so an operator
//! can inspect it and decide to resolve or discard it.

use crate::event_bus::BusMessage;
use crate::event_store::StorageError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

/// Pipeline stage at which a message failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// The payload could not be decoded.
    Decode,
    /// The event could not be stored.
    Persist,
    /// The notification could not be rendered.
    Render,
    /// The subscriber snapshot could not be read.
    Dispatch,
}

impl Stage {
    /// Database / metrics label for the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Persist => "persist",
            Self::Render => "render",
            Self::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decode" => Ok(Self::Decode),
            "persist" => Ok(Self::Persist),
            "render" => Ok(Self::Render),
            "dispatch" => Ok(Self::Dispatch),
            _ => Err(StorageError::Serialization(format!("Invalid stage: {s}"))),
        }
    }
}

/// Lifecycle of a dead-letter entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Waiting for an operator.
    Pending,
    /// Handled out of band.
    Resolved,
    /// Permanently given up on.
    Discarded,
}

impl DeadLetterStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }
}

impl FromStr for DeadLetterStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StorageError::Serialization(format!(
                "Invalid dead letter status: {s}"
            ))),
        }
    }
}

/// A failed bus message as kept by the dead-letter queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// Entry identifier.
    pub id: i64,

    /// Subject the message arrived on.
    pub subject: String,

    /// Raw payload, verbatim.
    pub payload: Vec<u8>,

    /// Stage that failed.
    pub stage: Stage,

    /// Human-readable error.
    pub error_message: String,

    /// Debug rendering of the error, if any.
    pub error_details: Option<String>,

    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,

    /// Current status.
    pub status: DeadLetterStatus,

    /// When the entry was resolved or discarded.
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it.
    pub resolved_by: Option<String>,

    /// Operator notes.
    pub resolution_notes: Option<String>,
}

/// Sink for messages the pipeline gave up on.
pub trait DeadLetterSink: Send + Sync {
    /// Record a failed message. Returns the entry id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the entry cannot be written.
    fn record<'a>(
        &'a self,
        message: &'a BusMessage,
        stage: Stage,
        error_message: &'a str,
        error_details: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StorageError>> + Send + 'a>>;

    /// Number of entries still pending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the count query fails.
    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<i64, StorageError>> + Send + '_>>;
}
