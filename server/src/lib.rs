//! # Relay Server
//!
//! Production assembly of the notification relay: configuration from the
//! environment ([`config`]) and explicit construction of every component
//! ([`app`]).
//!
//! Two binaries are built from this crate:
//!
//! - `relay-server`: migrates the database and runs both listeners
//! - `relay-demo`: publishes a sample `customer.registered` message

pub mod app;
pub mod config;

pub use app::{AppError, RelayApp, shutdown_signal};
pub use config::{Config, ConfigError};
