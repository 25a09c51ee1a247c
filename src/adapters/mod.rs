//! Adapter interfaces for external systems.
//!
//! The orchestration core only sees these traits:
//! - Acquirer: discovers new episodes (RSS feeds)
//! - StageExecutor: performs one stage for one item (download, whisper, ollama)
//! - DigestRenderer: turns selected episodes into a payload (plain text, HTML)
//! - DeliveryTransport: sends a payload to one recipient (SMTP, Telegram, webhook)

pub mod downloader;
pub mod email;
pub mod feed;
pub mod html;
pub mod ollama;
pub mod render;
pub mod telegram;
pub mod webhook;
pub mod whisper;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{DigestEntry, DigestPayload, Item, NewItem, StageFailure, StageOutput};

pub use downloader::HttpDownloader;
pub use email::SmtpMailer;
pub use feed::FeedAcquirer;
pub use html::HtmlRenderer;
pub use ollama::OllamaSummarizer;
pub use render::PlainTextRenderer;
pub use telegram::TelegramClient;
pub use webhook::WebhookClient;
pub use whisper::WhisperTranscriber;

/// Source of new items
#[async_trait]
pub trait Acquirer: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Fetch candidate items; already-known ones are filtered by the registry
    async fn acquire(&self) -> Result<Vec<NewItem>>;
}

/// Performs one stage for one item.
///
/// Implementations must not touch the registry; the scheduler records the
/// returned outcome.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, item: &Item) -> Result<StageOutput, StageFailure>;
}

/// Renders digest entries into a deliverable payload
pub trait DigestRenderer: Send + Sync {
    fn render(&self, entries: &[DigestEntry], date: DateTime<Utc>) -> DigestPayload;
}

/// Error from a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
}

/// Sends a payload to one recipient
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, payload: &DigestPayload, recipient: &str) -> Result<(), DeliveryError>;
}
