//! Bot API wire types.
//!
//! Only the fields the relay reads are modelled; unknown fields are ignored.

use relay_core::registry::ChatId;
use relay_core::transport::ChatCommand;
use serde::{Deserialize, Serialize};

/// Parse mode used for every outbound message.
pub const PARSE_MODE_MARKDOWN_V2: &str = "MarkdownV2";

/// Envelope around every Bot API response.
#[derive(Clone, Debug, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the call succeeded
    pub ok: bool,
    /// Payload on success
    pub result: Option<T>,
    /// Human-readable error
    pub description: Option<String>,
    /// Error code, mirrors the HTTP status
    pub error_code: Option<u16>,
    /// Extra error information
    pub parameters: Option<ResponseParameters>,
}

/// Extra information attached to some errors.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResponseParameters {
    /// Seconds to wait after flood control
    pub retry_after: Option<u64>,
}

/// The bot's own account, from `getMe`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BotUser {
    /// Bot id
    pub id: i64,
    /// Always true for bots
    pub is_bot: bool,
    /// Bot username, without `@`
    pub username: Option<String>,
}

/// One incoming update from `getUpdates`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Update {
    /// Monotonic update id
    pub update_id: i64,
    /// New incoming message, if this update carries one
    pub message: Option<Message>,
}

impl Update {
    /// The bot command this update carries, if any.
    ///
    /// A message counts as a command only when it starts with a
    /// `bot_command` entity.
    #[must_use]
    pub fn command(&self) -> Option<ChatCommand> {
        let message = self.message.as_ref()?;
        let text = message.text.as_deref()?;
        let leads_with_command = message
            .entities
            .iter()
            .any(|entity| entity.kind == "bot_command" && entity.offset == 0);
        if !leads_with_command {
            return None;
        }
        ChatCommand::parse(ChatId(message.chat.id), text)
    }
}

/// A chat message.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Message {
    /// Message id within the chat
    pub message_id: i64,
    /// Chat the message belongs to
    pub chat: Chat,
    /// Text, for text messages
    pub text: Option<String>,
    /// Special entities in the text
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
}

/// A chat.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Chat {
    /// Chat id
    pub id: i64,
}

/// A special entity in a message text (command, mention, link...).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MessageEntity {
    /// Entity type, e.g. `bot_command`
    #[serde(rename = "type")]
    pub kind: String,
    /// Offset in UTF-16 code units
    pub offset: usize,
    /// Length in UTF-16 code units
    pub length: usize,
}

/// `sendMessage` request body.
#[derive(Clone, Debug, Serialize)]
pub struct SendMessageRequest<'a> {
    /// Recipient
    pub chat_id: i64,
    /// Message text
    pub text: &'a str,
    /// Formatting mode
    pub parse_mode: &'static str,
}

/// `getUpdates` request body.
#[derive(Clone, Debug, Serialize)]
pub struct GetUpdatesRequest {
    /// First update to return; confirms every earlier one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    /// Long-poll timeout in seconds
    pub timeout: u64,
    /// Update kinds to receive
    pub allowed_updates: Vec<&'static str>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn update(json: serde_json::Value) -> Update {
        serde_json::from_value(json).expect("update parses")
    }

    #[test]
    fn start_command_is_recognised() {
        let update = update(serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 1,
                "chat": { "id": 42, "type": "private" },
                "text": "/start@relay_bot",
                "entities": [{ "type": "bot_command", "offset": 0, "length": 16 }]
            }
        }));

        let command = update.command().expect("command");
        assert_eq!(command.chat_id, ChatId(42));
        assert_eq!(command.command, "start");
    }

    #[test]
    fn text_without_command_entity_is_not_a_command() {
        let update = update(serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 1,
                "chat": { "id": 42 },
                "text": "/start"
            }
        }));

        assert!(update.command().is_none());
    }

    #[test]
    fn updates_without_message_are_skipped() {
        let update = update(serde_json::json!({ "update_id": 8, "edited_message": {} }));
        assert!(update.command().is_none());
    }

    #[test]
    fn send_message_body_uses_markdown_v2() {
        let body = serde_json::to_value(SendMessageRequest {
            chat_id: 42,
            text: "hi",
            parse_mode: PARSE_MODE_MARKDOWN_V2,
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "chat_id": 42, "text": "hi", "parse_mode": "MarkdownV2" })
        );
    }
}
