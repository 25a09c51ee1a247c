//! Telegram Bot API transport for digest delivery.
//!
//! Recipients are chat ids. Digests longer than one Telegram message are
//! split on line boundaries and sent as consecutive messages.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{DeliveryError, DeliveryTransport};
use crate::domain::DigestPayload;

/// Telegram rejects messages longer than this many characters
const MAX_MESSAGE_CHARS: usize = 4096;

/// Telegram Bot API client
pub struct TelegramClient {
    /// Bot token
    bot_token: String,
    /// API root, overridable for tests and self-hosted Bot API servers
    api_base: String,
    /// HTTP client
    client: reqwest::Client,
}

/// Response from Telegram API
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Message result from sendMessage
#[derive(Debug, Deserialize)]
struct MessageResult {
    message_id: i64,
}

impl TelegramClient {
    /// Create a new Telegram client
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            api_base: "https://api.telegram.org".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Build API URL
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Send a text message to one chat
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<i64, DeliveryError> {
        let url = self.api_url("sendMessage");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(format!("Failed to send Telegram message: {}", e)))?;

        let result: TelegramResponse<MessageResult> = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transport(format!("Failed to parse Telegram response: {}", e)))?;

        if !result.ok {
            return Err(DeliveryError::Rejected(format!(
                "Telegram API error: {}",
                result.description.unwrap_or_default()
            )));
        }

        Ok(result.result.map(|r| r.message_id).unwrap_or(0))
    }
}

#[async_trait]
impl DeliveryTransport for TelegramClient {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, payload: &DigestPayload, recipient: &str) -> Result<(), DeliveryError> {
        if recipient.trim().is_empty() {
            return Err(DeliveryError::InvalidRecipient("empty chat id".to_string()));
        }

        let text = format!("{}\n\n{}", payload.subject, payload.body);
        let chunks = split_message(&text, MAX_MESSAGE_CHARS);
        for chunk in &chunks {
            self.send_message(recipient, chunk).await?;
        }

        debug!(chat_id = recipient, parts = chunks.len(), "Digest sent to Telegram");
        Ok(())
    }
}

/// Split `text` into pieces of at most `max_chars` characters, preferring line breaks
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();

        if current_len + line_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > max_chars {
            // A single oversized line is cut on character boundaries
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url() {
        let client = TelegramClient::new("TOKEN".to_string());
        assert_eq!(
            client.api_url("sendMessage"),
            "https://api.telegram.org/botTOKEN/sendMessage"
        );

        let local = TelegramClient::new("T".to_string()).with_api_base("http://localhost:8081/");
        assert_eq!(local.api_url("getMe"), "http://localhost:8081/botT/getMe");
    }

    #[test]
    fn test_short_message_is_one_chunk() {
        assert_eq!(split_message("hello\nworld", 4096), vec!["hello\nworld"]);
    }

    #[test]
    fn test_split_on_line_boundaries() {
        let text = "aaaa\nbbbb\ncccc\n";
        let chunks = split_message(text, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n", "cccc\n"]);
    }

    #[test]
    fn test_oversized_line_is_cut() {
        let chunks = split_message("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }
}
