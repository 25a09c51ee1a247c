//! Webhook transport for digest delivery.
//!
//! Endpoint: POST <endpoint>
//! Auth: Bearer token (optional)
//!
//! One request per recipient; the recipient address travels in the body and
//! the receiving service does the final hop (mail relay, chat bridge, ...).

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{DeliveryError, DeliveryTransport};
use crate::domain::DigestPayload;

/// Webhook client
pub struct WebhookClient {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

/// Body of a digest webhook request
#[derive(Debug, Serialize)]
pub struct DigestWebhookPayload<'a> {
    pub to: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<&'a str>,
    pub entry_count: usize,
}

impl WebhookClient {
    /// Create a new client
    pub fn new(endpoint: String, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint,
            token,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DeliveryTransport for WebhookClient {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, payload: &DigestPayload, recipient: &str) -> Result<(), DeliveryError> {
        if recipient.trim().is_empty() {
            return Err(DeliveryError::InvalidRecipient("empty address".to_string()));
        }

        let body = DigestWebhookPayload {
            to: recipient,
            subject: &payload.subject,
            body: &payload.body,
            html: payload.html.as_deref(),
            entry_count: payload.entry_count,
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(format!("Failed to reach webhook: {}", e)))?;

        // 202 Accepted is expected for async processing
        let status = response.status();
        if status.is_success() {
            debug!(recipient, %status, "Digest accepted by webhook");
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected(format!("webhook error ({}): {}", status, text)))
        }
    }
}
