use anyhow::{Context, Result};
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum message length for Telegram's sendMessage API.
pub const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_SEND_TIMEOUT_SECONDS: u64 = 15;

/// Pushes one formatted message to one chat.
#[async_trait::async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Outcome of one send in a fan-out.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub chat_id: i64,
    pub result: Result<()>,
}

impl DeliveryOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Send `text` to every recipient concurrently. One failing chat never blocks
/// the others; each failure is logged and reported in its own outcome.
pub async fn deliver_all(deliverer: &dyn Deliverer, recipients: &[i64], text: &str) -> Vec<DeliveryOutcome> {
    let sends = recipients.iter().map(|&chat_id| async move {
        let result = deliverer.deliver(chat_id, text).await;
        match &result {
            Ok(()) => debug!(chat_id, "digest delivered"),
            Err(e) => warn!(chat_id, error = %format!("{:#}", e), "delivery failed"),
        }
        DeliveryOutcome { chat_id, result }
    });

    join_all(sends).await
}

/// Minimal Bot API client: sendMessage for delivery, getUpdates for commands.
#[derive(Clone)]
pub struct TelegramClient {
    token: String,
    api_base: String,
    send_timeout: Duration,
    client: Client,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECONDS),
            client: Client::new(),
        }
    }

    /// Deadline for one sendMessage call. A chat that never answers must not
    /// hold the cycle.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Point the client at another Bot API server (local server, test mock).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Send a message, splitting it when it exceeds Telegram's length limit.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    /// Markdown first; if Telegram cannot parse the markup, resend as plain
    /// text. Any other rejection (blocked bot, rate limit, unknown chat) is
    /// returned as is.
    async fn send_message_chunk(&self, chat_id: i64, text: &str) -> Result<()> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .timeout(self.send_timeout)
            .json(&markdown_body)
            .send()
            .await
            .context("sendMessage request failed")?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        let markdown_err = markdown_resp.text().await.unwrap_or_default();
        if !is_markup_rejection(markdown_status, &markdown_err) {
            anyhow::bail!("sendMessage failed with status {}: {}", markdown_status, markdown_err);
        }
        warn!(
            chat_id,
            status = %markdown_status,
            "sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .timeout(self.send_timeout)
            .json(&plain_body)
            .send()
            .await
            .context("sendMessage request failed")?;

        if !plain_resp.status().is_success() {
            let plain_status = plain_resp.status();
            let plain_err = plain_resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "sendMessage failed (markdown: {}, plain: {} {})",
                markdown_status,
                plain_status,
                plain_err
            );
        }

        Ok(())
    }

    /// Long-poll for updates after `offset`. The HTTP deadline is a little
    /// longer than the poll timeout so an idle poll is not reported as an error.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"]
        });

        let resp = self
            .client
            .post(self.api_url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs + 10))
            .json(&body)
            .send()
            .await
            .context("getUpdates request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            anyhow::bail!("getUpdates failed with status {}: {}", status, err);
        }

        let data: UpdatesResponse = resp.json().await.context("failed to parse getUpdates response")?;
        if !data.ok {
            anyhow::bail!(
                "getUpdates rejected: {}",
                data.description.unwrap_or_else(|| "no description".to_string())
            );
        }
        Ok(data.result)
    }
}

#[async_trait::async_trait]
impl Deliverer for TelegramClient {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<()> {
        self.send_message(chat_id, text).await
    }
}

/// Telegram answers 400 "can't parse entities" when the Markdown is invalid.
fn is_markup_rejection(status: StatusCode, body: &str) -> bool {
    status == StatusCode::BAD_REQUEST && body.contains("parse entities")
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
    description: Option<String>,
}

/// The subset of a Telegram update the command loop cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// Split `text` into chunks of at most `max_chars` characters, preferring line
/// breaks, then spaces. The separator a chunk was cut at is dropped; leading
/// indentation of the next line is kept.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_chars {
            chunks.push(remaining.to_string());
            break;
        }

        // Byte offset of the first char past the limit.
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..limit];
        let separator = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0);

        match separator {
            Some(at) => {
                chunks.push(remaining[..at].to_string());
                // Both separators are one byte.
                remaining = &remaining[at + 1..];
            }
            None => {
                chunks.push(remaining[..limit].to_string());
                remaining = &remaining[limit..];
            }
        }
    }

    chunks
}
