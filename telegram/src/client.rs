//! Telegram Bot API client

use crate::error::TelegramError;
use crate::types::{
    ApiResponse, BotUser, GetUpdatesRequest, Message, PARSE_MODE_MARKDOWN_V2,
    SendMessageRequest, Update,
};
use relay_core::ack::{Ack, Received};
use relay_core::registry::ChatId;
use relay_core::transport::{
    ChatTransport, CommandSource, CommandStream, DeliveryError, ReceivedCommand, TransportError,
};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Public Bot API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Default `getUpdates` long-poll timeout.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay after a failed poll.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Telegram bot, acting as both [`ChatTransport`] and [`CommandSource`].
#[derive(Clone)]
pub struct TelegramBot {
    client: Client,
    token: String,
    api_url: String,
    poll_timeout: Duration,
    retry_delay: Duration,
}

impl fmt::Debug for TelegramBot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramBot")
            .field("token", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

impl TelegramBot {
    /// Create a bot talking to the public Bot API.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            token: token.into(),
            api_url: DEFAULT_API_URL.to_string(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Use another API endpoint (local Bot API server, test double).
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the long-poll timeout.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the delay after a failed poll.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_url, self.token)
    }

    /// Describe the bot account. Used to check the token.
    ///
    /// # Errors
    ///
    /// Returns [`TelegramError`] for network failures or API errors.
    pub async fn get_me(&self) -> Result<BotUser, TelegramError> {
        let response = self
            .client
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(|e| TelegramError::RequestFailed(e.to_string()))?;

        parse_response(response).await
    }

    /// Send a `MarkdownV2` text message.
    ///
    /// # Errors
    ///
    /// Returns [`TelegramError`] for network failures or API errors; flood
    /// control, blocked bots and unknown chats get their own variants.
    pub async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
    ) -> Result<Message, TelegramError> {
        let request = SendMessageRequest {
            chat_id: chat_id.0,
            text,
            parse_mode: PARSE_MODE_MARKDOWN_V2,
        };
        self.post("sendMessage", &request, None).await
    }

    /// Fetch updates after `offset`, waiting up to `timeout` for new ones.
    ///
    /// # Errors
    ///
    /// Returns [`TelegramError`] for network failures or API errors.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, TelegramError> {
        let request = GetUpdatesRequest {
            offset,
            timeout: timeout.as_secs(),
            allowed_updates: vec!["message"],
        };
        // The HTTP timeout must outlast the long poll.
        self.post("getUpdates", &request, Some(timeout + Duration::from_secs(10)))
            .await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, TelegramError> {
        let mut request = self.client.post(self.method_url(method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TelegramError::RequestFailed(e.to_string()))?;

        parse_response(response).await
    }

    /// Long-poll updates and hand commands to `tx` one at a time.
    ///
    /// The next poll's `offset` confirms every update before it, so a
    /// command is only confirmed after its [`Ack`] fired. A dropped ack ends
    /// the task and leaves the command to be fetched again.
    async fn poll_commands(self, tx: mpsc::Sender<Result<ReceivedCommand, TransportError>>) {
        let mut offset: Option<i64> = None;

        loop {
            match self.get_updates(offset, self.poll_timeout).await {
                Ok(updates) => {
                    for update in updates {
                        let Some(command) = update.command() else {
                            tracing::trace!(
                                update_id = update.update_id,
                                "Skipping non-command update"
                            );
                            offset = Some(update.update_id + 1);
                            continue;
                        };
                        tracing::debug!(
                            update_id = update.update_id,
                            chat_id = %command.chat_id,
                            command = %command.command,
                            "Received bot command"
                        );

                        let (handled_tx, handled_rx) = oneshot::channel();
                        let ack = Ack::new(move || {
                            let _ = handled_tx.send(());
                        });
                        if tx.send(Ok(Received::new(command, ack))).await.is_err() {
                            return;
                        }
                        if handled_rx.await.is_err() {
                            tracing::debug!(
                                update_id = update.update_id,
                                "Command not acknowledged, leaving it unconfirmed"
                            );
                            return;
                        }
                        offset = Some(update.update_id + 1);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "getUpdates failed, retrying in {:?}",
                        self.retry_delay
                    );
                    if tx.send(Err(e.into())).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(self.retry_delay).await;
                }
            }

            if tx.is_closed() {
                return;
            }
        }
    }
}

async fn parse_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TelegramError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| TelegramError::RequestFailed(e.to_string()))?;

    let envelope: ApiResponse<T> = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => {
            return Err(TelegramError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }
        Err(e) => return Err(TelegramError::ResponseParseFailed(e.to_string())),
    };

    if envelope.ok {
        return envelope
            .result
            .ok_or_else(|| TelegramError::ResponseParseFailed("Missing result".to_string()));
    }

    let code = envelope.error_code.unwrap_or_else(|| status.as_u16());
    let description = envelope.description.unwrap_or_default();
    Err(match StatusCode::from_u16(code).unwrap_or(status) {
        StatusCode::TOO_MANY_REQUESTS => TelegramError::RateLimited {
            retry_after: envelope.parameters.and_then(|p| p.retry_after),
        },
        StatusCode::FORBIDDEN => TelegramError::Forbidden(description),
        StatusCode::BAD_REQUEST if description.to_lowercase().contains("chat not found") => {
            TelegramError::ChatNotFound(description)
        }
        _ => TelegramError::ApiError {
            status: code,
            message: description,
        },
    })
}

impl ChatTransport for TelegramBot {
    fn send_text(
        &self,
        recipient: ChatId,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>> {
        let text = text.to_string();
        Box::pin(async move {
            let sent = self.send_message(recipient, &text).await?;
            tracing::debug!(chat_id = %recipient, message_id = sent.message_id, "Message sent");
            Ok(())
        })
    }
}

impl CommandSource for TelegramBot {
    /// Check the token, then long-poll `getUpdates` in a background task.
    ///
    /// Commands arrive one at a time: the task waits for each command's ack
    /// before confirming it through the `offset` of the next poll. It stops
    /// once the stream or an unfired ack is dropped.
    fn commands(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<CommandStream, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let me = self.get_me().await?;
            tracing::info!(
                bot_id = me.id,
                username = me.username.as_deref().unwrap_or_default(),
                "Polling Telegram for commands"
            );

            let (tx, mut rx) = mpsc::channel(1);
            tokio::spawn(self.clone().poll_commands(tx));

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as CommandStream)
        })
    }
}
