//! SMTP transport for digest delivery.
//!
//! One message per recipient, sent over STARTTLS with optional login. A
//! payload carrying HTML goes out as `multipart/alternative` with the plain
//! text first; otherwise the message is plain text only.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use super::{DeliveryError, DeliveryTransport};
use crate::config::EmailSettings;
use crate::domain::DigestPayload;

/// SMTP mailer
pub struct SmtpMailer {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(settings: &EmailSettings) -> Result<Self> {
        let server = settings
            .smtp_server
            .as_deref()
            .filter(|s| !s.is_empty())
            .context("email.smtp_server is not set")?;

        let sender = settings
            .from
            .as_deref()
            .or(settings.username.as_deref())
            .context("email.from is not set")?;
        let from: Mailbox = sender
            .parse()
            .with_context(|| format!("Invalid sender address: {}", sender))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server)
            .with_context(|| format!("Failed to configure SMTP relay: {}", server))?
            .port(settings.smtp_port)
            .timeout(Some(Duration::from_secs(settings.timeout_secs)));
        if let (Some(user), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(Self {
            from,
            transport: builder.build(),
        })
    }

    pub fn from_address(&self) -> &Mailbox {
        &self.from
    }
}

/// Build the message for one recipient
pub fn build_message(
    from: &Mailbox,
    payload: &DigestPayload,
    recipient: &str,
) -> Result<Message, DeliveryError> {
    let to: Mailbox = recipient
        .trim()
        .parse()
        .map_err(|e| DeliveryError::InvalidRecipient(format!("{}: {}", recipient, e)))?;

    let builder = Message::builder()
        .from(from.clone())
        .to(to)
        .subject(payload.subject.as_str());

    let message = match &payload.html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            payload.body.clone(),
            html.clone(),
        )),
        None => builder.singlepart(SinglePart::plain(payload.body.clone())),
    };

    message.map_err(|e| DeliveryError::Transport(format!("Failed to build message: {}", e)))
}

#[async_trait]
impl DeliveryTransport for SmtpMailer {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, payload: &DigestPayload, recipient: &str) -> Result<(), DeliveryError> {
        let message = build_message(&self.from, payload, recipient)?;

        match self.transport.send(message).await {
            Ok(response) => {
                debug!(recipient, code = %response.code(), "Digest accepted by SMTP server");
                Ok(())
            }
            Err(e) if e.is_permanent() => Err(DeliveryError::Rejected(format!(
                "SMTP server refused {}: {}",
                recipient, e
            ))),
            Err(e) => Err(DeliveryError::Transport(format!("SMTP error: {}", e))),
        }
    }
}
