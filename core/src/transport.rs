//! Chat transport capabilities.
//!
//! Two sides of the chat bot:
//!
//! - [`ChatTransport`]: send a text message to one recipient. Used by the
//!   fanout dispatcher and for registration confirmations.
//! - [`CommandSource`]: stream of inbound bot commands (`/start`, ...).
//!
//! Outbound text is sent in the transport's rich-text mode (Telegram
//! `MarkdownV2`); callers are responsible for escaping.

use crate::ack::Received;
use crate::registry::ChatId;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failure to deliver a message to a single recipient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The transport throttled the request.
    #[error("Rate limited (retry after {retry_after:?}s)")]
    RateLimited {
        /// Seconds the transport asked us to wait, when provided.
        retry_after: Option<u64>,
    },

    /// The recipient blocked the bot or the bot may not write to the chat.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The chat does not exist (deleted account, wrong id).
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    /// The transport rejected the request.
    #[error("API error (status {status}): {message}")]
    Api {
        /// HTTP status or transport error code
        status: u16,
        /// Error description from the transport
        message: String,
    },

    /// Network failure.
    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Failure of the inbound command channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network failure while polling.
    #[error("Polling failed: {0}")]
    Polling(String),

    /// The transport rejected the request.
    #[error("API error (status {status}): {message}")]
    Api {
        /// HTTP status or transport error code
        status: u16,
        /// Error description from the transport
        message: String,
    },

    /// Response could not be parsed.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A bot command received from a chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatCommand {
    /// Chat the command came from.
    pub chat_id: ChatId,

    /// Command name without the leading slash or bot mention (`start`).
    pub command: String,

    /// Text after the command, trimmed.
    pub arguments: String,
}

impl ChatCommand {
    /// Parse a command from message text.
    ///
    /// Accepts `/name`, `/name args` and `/name@botname args`. Returns `None`
    /// for text that is not a command.
    ///
    /// ```
    /// use relay_core::registry::ChatId;
    /// use relay_core::transport::ChatCommand;
    ///
    /// let cmd = ChatCommand::parse(ChatId(7), "/start@relay_bot hello").unwrap();
    /// assert_eq!(cmd.command, "start");
    /// assert_eq!(cmd.arguments, "hello");
    /// assert!(ChatCommand::parse(ChatId(7), "hello").is_none());
    /// ```
    #[must_use]
    pub fn parse(chat_id: ChatId, text: &str) -> Option<Self> {
        let rest = text.strip_prefix('/')?;
        let (head, arguments) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let command = head.split('@').next().unwrap_or_default();
        if command.is_empty() {
            return None;
        }

        Some(Self {
            chat_id,
            command: command.to_string(),
            arguments: arguments.trim().to_string(),
        })
    }
}

/// A command awaiting acknowledgement.
pub type ReceivedCommand = Received<ChatCommand>;

/// Stream of inbound commands.
pub type CommandStream =
    Pin<Box<dyn Stream<Item = Result<ReceivedCommand, TransportError>> + Send>>;

/// Outbound side of the chat bot.
pub trait ChatTransport: Send + Sync {
    /// Send `text` to one recipient.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] describing why this recipient was not reached.
    fn send_text(
        &self,
        recipient: ChatId,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>>;
}

/// Inbound side of the chat bot.
pub trait CommandSource: Send + Sync {
    /// Start receiving commands.
    ///
    /// The stream runs until the source shuts down; transient polling
    /// failures are yielded as error items. A command is confirmed to the
    /// chat service only after its [`Ack`](crate::ack::Ack) fires.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the command channel cannot be opened.
    fn commands(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<CommandStream, TransportError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_command() {
        let cmd = ChatCommand::parse(ChatId(1), "/start");
        assert_eq!(
            cmd,
            Some(ChatCommand {
                chat_id: ChatId(1),
                command: "start".to_string(),
                arguments: String::new(),
            })
        );
    }

    #[test]
    fn strips_bot_mention_and_keeps_arguments() {
        let cmd = ChatCommand::parse(ChatId(1), "/start@relay_bot  ref-42 ");
        let cmd = cmd.map(|c| (c.command, c.arguments));
        assert_eq!(cmd, Some(("start".to_string(), "ref-42".to_string())));
    }

    #[test]
    fn rejects_non_commands() {
        assert!(ChatCommand::parse(ChatId(1), "start").is_none());
        assert!(ChatCommand::parse(ChatId(1), "/").is_none());
        assert!(ChatCommand::parse(ChatId(1), "/@bot").is_none());
    }
}
