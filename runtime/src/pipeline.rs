//! Per-message ingestion pipeline.
//!
//! Every bus message walks the same stages:
//!
//! ```text
//! Received ─► Routed ─► Decoded ─► Persisted ─► Rendered ─► Dispatched ─► Done
//!               │          │           │            │            │
//!               ▼          └───────────┴──── Failed ┴────────────┘
//!            Ignored
//! ```
//!
//! Routing uses the static [`EventKind`] table; subjects without a kind are
//! ignored. Persistence always precedes fanout, so a stored event exists for
//! every notification sent.
//!
//! # Failure policy
//!
//! A decode failure is always isolated: the raw payload is dead-lettered and
//! the listener moves on. Storage and render failures follow the configured
//! [`FailurePolicy`]:
//!
//! - [`FailurePolicy::Isolate`] (default): log, dead-letter, continue
//! - [`FailurePolicy::Halt`]: log, dead-letter, and return the error so the
//!   listener stops and the process exits
//!
//! Per-recipient delivery failures never fail the pipeline; they are part of
//! the [`DeliveryReport`].

use crate::dispatcher::{DeliveryReport, FanoutDispatcher};
use crate::metrics::{MessageOutcome, RelayMetrics};
use crate::renderer::{RenderError, TemplateRenderer};
use relay_core::dead_letter::{DeadLetterSink, Stage};
use relay_core::decoder::{DecodeError, decode};
use relay_core::event::EventKind;
use relay_core::event_bus::BusMessage;
use relay_core::event_store::{EventStore, StorageError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// How the pipeline reacts to storage and render failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Dead-letter the message and keep consuming.
    #[default]
    Isolate,
    /// Dead-letter the message and stop the listener.
    Halt,
}

impl FailurePolicy {
    /// Configuration spelling of the policy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Isolate => "isolate",
            Self::Halt => "halt",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised failure policy name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown failure policy '{0}' (expected 'isolate' or 'halt')")]
pub struct UnknownPolicy(pub String);

impl FromStr for FailurePolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolate" => Ok(Self::Isolate),
            "halt" => Ok(Self::Halt),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

/// A stage of the pipeline failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The payload could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// The event could not be stored.
    #[error("Persist failed: {0}")]
    Persist(#[source] StorageError),

    /// The notification could not be rendered.
    #[error("Render failed: {0}")]
    Render(#[from] RenderError),

    /// The subscriber snapshot could not be read.
    #[error("Dispatch failed: {0}")]
    Dispatch(#[source] StorageError),
}

impl PipelineError {
    /// Stage at which the pipeline failed.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Decode(_) => Stage::Decode,
            Self::Persist(_) => Stage::Persist,
            Self::Render(_) => Stage::Render,
            Self::Dispatch(_) => Stage::Dispatch,
        }
    }
}

/// What happened to a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// No handler for the subject; nothing stored or sent.
    Ignored,
    /// Stored and fanned out.
    Dispatched {
        /// Id of the stored event.
        stored_event_id: i64,
        /// Per-recipient results.
        report: DeliveryReport,
    },
    /// Failed and isolated; the message was dead-lettered.
    Failed {
        /// Failed stage.
        stage: Stage,
    },
}

/// Decode, persist, render and fan out bus messages.
pub struct Pipeline {
    store: Arc<dyn EventStore>,
    renderer: Arc<TemplateRenderer>,
    dispatcher: FanoutDispatcher,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: FailurePolicy,
}

impl Pipeline {
    /// Create a pipeline with the default [`FailurePolicy::Isolate`].
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        renderer: Arc<TemplateRenderer>,
        dispatcher: FanoutDispatcher,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            store,
            renderer,
            dispatcher,
            dead_letters,
            policy: FailurePolicy::default(),
        }
    }

    /// Set the failure policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Configured failure policy.
    #[must_use]
    pub const fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Run one message through the pipeline and apply the failure policy.
    ///
    /// # Errors
    ///
    /// Returns the [`PipelineError`] only under [`FailurePolicy::Halt`], for
    /// storage and render failures. Everything else is reported through the
    /// returned [`Outcome`].
    pub async fn handle(&self, message: &BusMessage) -> Result<Outcome, PipelineError> {
        let started = Instant::now();

        match self.process(message).await {
            Ok(outcome) => {
                let label = if outcome == Outcome::Ignored {
                    MessageOutcome::Ignored
                } else {
                    RelayMetrics::record_pipeline_duration(started.elapsed());
                    MessageOutcome::Dispatched
                };
                RelayMetrics::record_message(label);
                Ok(outcome)
            }
            Err(error) => {
                let stage = error.stage();
                RelayMetrics::record_message(MessageOutcome::Failed);
                tracing::error!(
                    subject = %message.subject,
                    stage = %stage,
                    error = %error,
                    policy = %self.policy,
                    "Pipeline failed"
                );
                self.dead_letter(message, &error).await;

                let halts = self.policy == FailurePolicy::Halt && stage != Stage::Decode;
                if halts {
                    Err(error)
                } else {
                    Ok(Outcome::Failed { stage })
                }
            }
        }
    }

    /// Run one message through the pipeline without applying the policy.
    ///
    /// # Errors
    ///
    /// Returns the [`PipelineError`] of the first failed stage.
    pub async fn process(&self, message: &BusMessage) -> Result<Outcome, PipelineError> {
        let Some(kind) = EventKind::from_subject(&message.subject) else {
            tracing::debug!(subject = %message.subject, "No handler for subject, ignoring");
            return Ok(Outcome::Ignored);
        };

        let event = decode(&message.subject, &message.payload)?;
        let context = kind.template_context(&event.payload);

        let stored = self.store.persist(event).await.map_err(PipelineError::Persist)?;
        RelayMetrics::record_persisted();
        tracing::info!(
            subject = %stored.subject,
            stored_event_id = stored.id,
            "Event persisted"
        );

        let text = self.renderer.render(kind.template_name(), &context).await?;

        let report = self
            .dispatcher
            .dispatch(&text)
            .await
            .map_err(PipelineError::Dispatch)?;
        tracing::info!(
            subject = %stored.subject,
            stored_event_id = stored.id,
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failures.len(),
            "Notification dispatched"
        );

        Ok(Outcome::Dispatched {
            stored_event_id: stored.id,
            report,
        })
    }

    async fn dead_letter(&self, message: &BusMessage, error: &PipelineError) {
        let stage = error.stage();
        let details = format!("{error:?}");

        match self
            .dead_letters
            .record(message, stage, &error.to_string(), Some(&details))
            .await
        {
            Ok(id) => {
                RelayMetrics::record_dead_letter(stage);
                tracing::warn!(
                    dead_letter_id = id,
                    subject = %message.subject,
                    stage = %stage,
                    "Message dead-lettered"
                );
            }
            Err(e) => {
                tracing::error!(
                    subject = %message.subject,
                    stage = %stage,
                    error = %e,
                    "Failed to dead-letter message, dropping it"
                );
            }
        }
    }
}
