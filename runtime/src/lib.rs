//! # Relay Runtime
//!
//! The moving parts of the notification relay, built on the capability traits
//! of `relay-core`:
//!
//! - [`renderer`]: Liquid templates to Telegram `MarkdownV2` text
//! - [`dispatcher`]: fanout of one text to every subscriber
//! - [`pipeline`]: decode, persist, render, dispatch, with a [`FailurePolicy`]
//! - [`consumer`]: bus listener (subscribe-process-reconnect loop)
//! - [`registration`]: chat `start` command listener
//! - [`metrics`]: Prometheus counters and exporter
//!
//! Both listeners take a `tokio::sync::broadcast` receiver and stop after
//! finishing their current item when it fires.

pub mod consumer;
pub mod dispatcher;
pub mod metrics;
pub mod pipeline;
pub mod registration;
pub mod renderer;

pub use consumer::{BusListener, MessageHandler};
pub use dispatcher::{DeliveryFailure, DeliveryReport, FanoutDispatcher};
pub use pipeline::{FailurePolicy, Outcome, Pipeline, PipelineError};
pub use registration::{RegistrationError, RegistrationListener};
pub use renderer::{RenderError, TemplateRenderer, escape_markdown_v2};
