//! RSS/Atom acquisition.
//!
//! Each configured feed is fetched and parsed independently; a feed that
//! fails is logged and skipped. Only the newest entries with an audio
//! enclosure are offered to the registry, which drops guids it already knows.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use feed_rs::model::Entry;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::Acquirer;
use crate::config::FeedSource;
use crate::domain::NewItem;

/// Fetches podcast feeds over HTTP
pub struct FeedAcquirer {
    feeds: Vec<FeedSource>,
    max_entries_per_feed: usize,
    client: reqwest::Client,
}

impl FeedAcquirer {
    pub fn new(feeds: Vec<FeedSource>, max_entries_per_feed: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("podcast-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            feeds,
            max_entries_per_feed,
            client,
        })
    }

    /// Fetch and parse one feed
    pub async fn fetch_feed(&self, source: &FeedSource) -> Result<Vec<NewItem>> {
        let response = self
            .client
            .get(&source.url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch feed: {}", source.url))?
            .error_for_status()
            .with_context(|| format!("Feed returned an error status: {}", source.url))?;

        let body = response
            .bytes()
            .await
            .context("Failed to read feed body")?;

        parse_feed(&body, source, self.max_entries_per_feed)
    }
}

#[async_trait]
impl Acquirer for FeedAcquirer {
    fn name(&self) -> &str {
        "rss"
    }

    async fn acquire(&self) -> Result<Vec<NewItem>> {
        let mut items = Vec::new();

        for source in &self.feeds {
            match self.fetch_feed(source).await {
                Ok(found) => {
                    info!(podcast = %source.name, entries = found.len(), "Fetched feed");
                    items.extend(found);
                }
                Err(e) => {
                    warn!(podcast = %source.name, error = %format!("{:#}", e), "Feed fetch failed");
                }
            }
        }

        Ok(items)
    }
}

/// Parse feed bytes into candidate items, newest first, at most `max_entries`
pub fn parse_feed(bytes: &[u8], source: &FeedSource, max_entries: usize) -> Result<Vec<NewItem>> {
    let feed = feed_rs::parser::parse(bytes)
        .with_context(|| format!("Failed to parse feed: {}", source.url))?;

    let mut entries = feed.entries;
    // Entries without a date sort last
    entries.sort_by(|a, b| b.published.or(b.updated).cmp(&a.published.or(a.updated)));

    let items = entries
        .into_iter()
        .filter_map(|entry| {
            let item = entry_to_item(entry, &source.name);
            if item.is_none() {
                debug!(podcast = %source.name, "Skipping entry without audio");
            }
            item
        })
        .take(max_entries)
        .collect();

    Ok(items)
}

fn entry_to_item(entry: Entry, podcast: &str) -> Option<NewItem> {
    let (audio_url, file_size) = audio_enclosure(&entry)?;

    let guid = if entry.id.trim().is_empty() {
        guid_from_url(&audio_url)
    } else {
        entry.id.clone()
    };

    Some(NewItem {
        guid,
        podcast: podcast.to_string(),
        title: entry
            .title
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default(),
        description: entry
            .summary
            .map(|s| s.content.trim().to_string())
            .filter(|s| !s.is_empty()),
        episode_url: entry
            .links
            .iter()
            .find(|l| !is_audio(l.media_type.as_deref()))
            .map(|l| l.href.clone()),
        published_at: entry.published.or(entry.updated).unwrap_or_else(Utc::now),
        audio_url,
        file_size,
    })
}

/// First audio enclosure: media content, then links
fn audio_enclosure(entry: &Entry) -> Option<(String, Option<u64>)> {
    let from_media = entry.media.iter().flat_map(|m| m.content.iter()).find_map(|c| {
        let url = c.url.as_ref()?;
        let content_type = c.content_type.as_ref().map(|m| m.to_string());
        let audio_like = is_audio(content_type.as_deref()) || content_type.is_none();
        audio_like.then(|| (url.to_string(), c.size))
    });

    from_media.or_else(|| {
        entry
            .links
            .iter()
            .find(|l| is_audio(l.media_type.as_deref()))
            .map(|l| (l.href.clone(), l.length))
    })
}

fn is_audio(media_type: Option<&str>) -> bool {
    media_type.map(|t| t.starts_with("audio/")).unwrap_or(false)
}

/// Stable identity for entries that carry no id
pub fn guid_from_url(audio_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(audio_url.as_bytes());
    hex::encode(hasher.finalize())
}
