//! # Telegram transport
//!
//! Bot API client used by the relay for both directions of the chat:
//!
//! - outbound: `sendMessage` in `MarkdownV2` ([`relay_core::transport::ChatTransport`])
//! - inbound: `getUpdates` long polling for bot commands
//!   ([`relay_core::transport::CommandSource`])
//!
//! ## Example
//!
//! ```no_run
//! use relay_core::registry::ChatId;
//! use relay_telegram::TelegramBot;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bot = TelegramBot::new("123456:ABC-DEF");
//! bot.send_message(ChatId(42), "Hello\\!").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod types;

pub use client::{DEFAULT_API_URL, DEFAULT_POLL_TIMEOUT, TelegramBot};
pub use error::TelegramError;
pub use types::{BotUser, Update};
