//! HTTP download stage.
//!
//! Streams the enclosure to
//! `<audio_dir>/<podcast_slug>/<YYYY-MM-DD>-<safe_title>.mp3`. The body is
//! written to a `.part` file first and renamed once complete, so a partial
//! file is never reported as the artifact.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::StageExecutor;
use crate::domain::{Item, StageFailure, StageOutput};

const USER_AGENT: &str = concat!("podcast-agent/", env!("CARGO_PKG_VERSION"));

/// Download stage executor
pub struct HttpDownloader {
    audio_dir: PathBuf,
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(audio_dir: PathBuf, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { audio_dir, client })
    }

    /// Destination for an item's audio
    pub fn audio_path(&self, item: &Item) -> PathBuf {
        audio_path_for(&self.audio_dir, item)
    }

    /// Stream `url` into `dest`, returning the byte count
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, StageFailure> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StageFailure::Transient(format!("Failed to start download: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StageFailure::Transient(format!("HTTP {} for {}", status, url)));
        }
        let content_length = response.content_length();

        let part_path = dest.with_extension("mp3.part");
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| StageFailure::Transient(format!("Failed to create file: {}", e)))?;

        let downloaded = match write_body(&mut response, &mut file, content_length).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&part_path, dest)
            .await
            .map_err(|e| StageFailure::Transient(format!("Failed to move download into place: {}", e)))?;

        Ok(downloaded)
    }
}

/// Copy the response body into `file`, checking it against Content-Length
async fn write_body(
    response: &mut reqwest::Response,
    file: &mut tokio::fs::File,
    content_length: Option<u64>,
) -> Result<u64, StageFailure> {
    let mut downloaded: u64 = 0;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| StageFailure::Transient(format!("Error reading download stream: {}", e)))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| StageFailure::Transient(format!("Failed to write chunk: {}", e)))?;
        downloaded += chunk.len() as u64;
    }

    file.flush()
        .await
        .map_err(|e| StageFailure::Transient(format!("Failed to flush file: {}", e)))?;

    if let Some(expected) = content_length {
        if downloaded != expected {
            return Err(StageFailure::Transient(format!(
                "Download incomplete: got {} bytes, expected {}",
                downloaded, expected
            )));
        }
    }

    Ok(downloaded)
}

#[async_trait]
impl StageExecutor for HttpDownloader {
    fn name(&self) -> &str {
        "http-download"
    }

    async fn execute(&self, item: &Item) -> Result<StageOutput, StageFailure> {
        if item.audio_url.trim().is_empty() {
            return Err(StageFailure::Permanent("item has no audio url".to_string()));
        }

        let dest = self.audio_path(item);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StageFailure::Transient(format!(
                    "Failed to create audio directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        debug!(item_id = item.id, url = %item.audio_url, dest = %dest.display(), "Downloading");
        let file_size = self.fetch(&item.audio_url, &dest).await?;
        info!(item_id = item.id, bytes = file_size, "Download complete");

        Ok(StageOutput::Downloaded {
            audio_path: dest.display().to_string(),
            file_size,
        })
    }
}

/// `<audio_dir>/<podcast_slug>/<YYYY-MM-DD>-<safe_title>.mp3`
pub fn audio_path_for(audio_dir: &Path, item: &Item) -> PathBuf {
    let podcast = item.podcast.trim().replace(' ', "_").to_lowercase();
    let podcast = if podcast.is_empty() {
        "unknown".to_string()
    } else {
        podcast
    };

    let safe_title: String = item
        .title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(*c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim_end()
        .replace(' ', "_")
        .chars()
        .take(100)
        .collect();
    // Titles made entirely of punctuation still need a unique name
    let safe_title = if safe_title.is_empty() {
        format!("episode_{}", item.id)
    } else {
        safe_title
    };

    audio_dir.join(podcast).join(format!(
        "{}-{}.mp3",
        item.published_at.format("%Y-%m-%d"),
        safe_title
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_audio_path_layout() {
        let item = crate::test_support::item_with(|item| {
            item.podcast = "Hard Fork".to_string();
            item.title = "AI & You: What's next?".to_string();
            item.published_at = Utc.with_ymd_and_hms(2024, 6, 7, 10, 0, 0).unwrap();
        });

        assert_eq!(
            audio_path_for(Path::new("/data/audio"), &item),
            PathBuf::from("/data/audio/hard_fork/2024-06-07-AI__You_Whats_next.mp3")
        );
    }

    #[test]
    fn test_title_without_usable_chars() {
        let item = crate::test_support::item_with(|item| {
            item.id = 42;
            item.title = "???".to_string();
        });
        let path = audio_path_for(Path::new("/a"), &item);
        assert!(path.to_string_lossy().ends_with("-episode_42.mp3"));
    }

    #[tokio::test]
    async fn test_empty_url_is_permanent() {
        let temp = tempfile::TempDir::new().unwrap();
        let downloader =
            HttpDownloader::new(temp.path().to_path_buf(), Duration::from_secs(5)).unwrap();
        let item = crate::test_support::item_with(|item| item.audio_url = String::new());

        let err = downloader.execute(&item).await.unwrap_err();
        assert!(matches!(err, StageFailure::Permanent(_)));
    }
}
