//! Main orchestrator for pipeline and digest runs.
//!
//! Wires the registry, ledger and scheduler to the configured adapters.
//! A pipeline run is acquisition followed by the three stages in order; a
//! digest run selects the window, renders it once and fans it out per channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    Acquirer, DigestRenderer, FeedAcquirer, HtmlRenderer, HttpDownloader, OllamaSummarizer,
    SmtpMailer, StageExecutor, TelegramClient, WebhookClient, WhisperTranscriber,
};
use crate::config::Settings;
use crate::domain::{
    ChannelDelivery, ChannelKind, DigestBatch, DigestEntry, DigestPayload, Item, Job, StageKind,
};

use super::database::Database;
use super::digest_log::DigestLog;
use super::fanout::FanoutDispatcher;
use super::ledger::JobLedger;
use super::registry::{ItemRegistry, RegistryStats};
use super::scheduler::{StageRunSummary, StageScheduler};
use super::window::DigestWindowSelector;

/// One executor per stage
#[derive(Clone)]
pub struct StageExecutors {
    pub download: Arc<dyn StageExecutor>,
    pub transcription: Arc<dyn StageExecutor>,
    pub summarization: Arc<dyn StageExecutor>,
}

impl StageExecutors {
    pub fn get(&self, stage: StageKind) -> Arc<dyn StageExecutor> {
        match stage {
            StageKind::Download => self.download.clone(),
            StageKind::Transcription => self.transcription.clone(),
            StageKind::Summarization => self.summarization.clone(),
        }
    }
}

/// An enabled delivery channel and its recipients
#[derive(Clone)]
pub struct DeliveryChannel {
    pub kind: ChannelKind,
    pub dispatcher: FanoutDispatcher,
    pub recipients: Vec<String>,
}

/// Result of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub new_items: usize,
    pub stages: Vec<StageRunSummary>,
}

impl PipelineReport {
    pub fn failed(&self) -> usize {
        self.stages.iter().map(|s| s.failed).sum()
    }
}

/// Result of one digest run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DigestReport {
    /// Nothing was summarized in the window; no batch is recorded
    NoContent {
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    },
    Sent {
        batch_id: i64,
        items: usize,
        deliveries: Vec<ChannelDelivery>,
        /// True when any channel reached at least one recipient
        delivered: bool,
    },
}

/// Snapshot shown by `status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub stats: RegistryStats,
    pub jobs: std::collections::BTreeMap<String, u64>,
    pub recent: Vec<Item>,
    pub errored: Vec<Item>,
    pub last_digest: Option<DigestBatch>,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    settings: Settings,
    registry: ItemRegistry,
    ledger: JobLedger,
    scheduler: StageScheduler,
    window: DigestWindowSelector,
    digest_log: DigestLog,
    acquirer: Arc<dyn Acquirer>,
    executors: StageExecutors,
    renderer: Arc<dyn DigestRenderer>,
    channels: Vec<DeliveryChannel>,
}

impl Orchestrator {
    /// Create an orchestrator over explicit collaborators
    pub fn new(
        settings: Settings,
        db: Database,
        acquirer: Arc<dyn Acquirer>,
        executors: StageExecutors,
        renderer: Arc<dyn DigestRenderer>,
        channels: Vec<DeliveryChannel>,
    ) -> Self {
        let registry = ItemRegistry::new(db.clone());
        let ledger = JobLedger::new(db.clone(), settings.max_retries);
        Self {
            scheduler: StageScheduler::new(registry.clone(), ledger.clone()),
            window: DigestWindowSelector::new(db.clone()),
            digest_log: DigestLog::new(db),
            registry,
            ledger,
            settings,
            acquirer,
            executors,
            renderer,
            channels,
        }
    }

    /// Create an orchestrator with the production adapters
    pub fn from_settings(settings: Settings, db: Database) -> Result<Self> {
        let acquirer = Arc::new(FeedAcquirer::new(
            settings.feeds.clone(),
            settings.max_entries_per_feed,
        )?);

        let executors = StageExecutors {
            download: Arc::new(HttpDownloader::new(
                settings.audio_dir.clone(),
                Duration::from_secs(settings.download_timeout_secs),
            )?),
            transcription: Arc::new(WhisperTranscriber::new(
                settings.whisper.clone(),
                settings.transcript_dir.clone(),
            )),
            summarization: Arc::new(OllamaSummarizer::new(
                settings.llm.clone(),
                settings.summary_dir.clone(),
            )?),
        };

        let channels = build_channels(&settings)?;
        let renderer = build_renderer(&settings);

        Ok(Self::new(
            settings,
            db,
            acquirer,
            executors,
            Arc::new(renderer),
            channels,
        ))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &ItemRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn digest_log(&self) -> &DigestLog {
        &self.digest_log
    }

    pub fn channels(&self) -> &[DeliveryChannel] {
        &self.channels
    }

    /// Fetch new items and register the unseen ones. Never fails the run.
    pub async fn acquire(&self) -> usize {
        let found = match self.acquirer.acquire().await {
            Ok(found) => found,
            Err(e) => {
                warn!(acquirer = self.acquirer.name(), error = %format!("{:#}", e), "Acquisition failed");
                return 0;
            }
        };

        match self.registry.insert_new(&found) {
            Ok(inserted) => {
                info!(found = found.len(), inserted, "Acquisition complete");
                inserted
            }
            Err(e) => {
                warn!(error = %e, "Failed to register acquired items");
                0
            }
        }
    }

    /// Acquire, then run download, transcription and summarization in order
    #[instrument(skip(self))]
    pub async fn run_pipeline(&self) -> Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        info!(%run_id, "Starting pipeline run");

        let new_items = self.acquire().await;

        let mut stages = Vec::with_capacity(StageKind::ALL.len());
        for stage in StageKind::ALL {
            let summary = self.run_stage(stage).await?;
            stages.push(summary);
        }

        let report = PipelineReport {
            run_id,
            new_items,
            stages,
        };
        info!(%run_id, new_items, failed = report.failed(), "Pipeline run complete");
        Ok(report)
    }

    /// Run one stage with its configured pool size and batch limit
    #[instrument(skip(self))]
    pub async fn run_stage(&self, stage: StageKind) -> Result<StageRunSummary> {
        let pool = self.settings.stage(stage);
        let summary = self
            .scheduler
            .run_stage_limited(
                stage,
                self.executors.get(stage),
                pool.concurrency,
                pool.batch_limit,
            )
            .await
            .with_context(|| format!("{} stage aborted", stage))?;

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Stage complete"
        );
        Ok(summary)
    }

    /// Entries for the window ending at `now`, most recent first
    pub fn digest_entries(&self, now: DateTime<Utc>) -> Result<Vec<DigestEntry>> {
        let items = self
            .window
            .select_for_window(self.settings.digest.window_hours, now)
            .context("Failed to select digest window")?;

        items
            .into_iter()
            .map(|item| {
                let summary = self
                    .registry
                    .summary_for(item.id)
                    .with_context(|| format!("Failed to load summary for item {}", item.id))?;
                if summary.is_none() {
                    debug!(item_id = item.id, "Summarized item has no stored summary");
                }
                Ok(DigestEntry { item, summary })
            })
            .collect()
    }

    /// Render the digest for `now` without sending or recording anything
    pub fn preview_digest(&self, now: DateTime<Utc>) -> Result<Option<DigestPayload>> {
        let entries = self.digest_entries(now)?;
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.renderer.render(&entries, now)))
    }

    /// Select, render, fan out per channel and record the batch
    #[instrument(skip(self))]
    pub async fn send_digest(&self, now: DateTime<Utc>) -> Result<DigestReport> {
        let (window_start, window_end) =
            DigestWindowSelector::bounds(self.settings.digest.window_hours, now);

        let entries = self.digest_entries(now)?;
        if entries.is_empty() {
            info!("No summarized episodes in window, skipping digest");
            return Ok(DigestReport::NoContent {
                window_start,
                window_end,
            });
        }

        let payload = self.renderer.render(&entries, now);

        if self.channels.is_empty() {
            warn!("No delivery channel configured");
        }

        let mut deliveries = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let outcome = channel
                .dispatcher
                .deliver(&payload, &channel.recipients)
                .await;
            let delivery = ChannelDelivery::from_outcome(channel.kind, &outcome, Utc::now());
            info!(
                channel = %channel.kind,
                sent = delivery.sent,
                delivered = delivery.delivered,
                failed = delivery.failed,
                "Channel delivery finished"
            );
            deliveries.push(delivery);
        }

        let batch = DigestBatch {
            id: None,
            digest_date: now,
            window_start,
            window_end,
            item_count: entries.len(),
            deliveries,
        };
        let delivered = batch.any_sent();
        let batch_id = self
            .digest_log
            .record(&batch)
            .context("Failed to record digest batch")?;

        info!(batch_id, items = entries.len(), delivered, "Digest run complete");

        Ok(DigestReport::Sent {
            batch_id,
            items: entries.len(),
            deliveries: batch.deliveries,
            delivered,
        })
    }

    /// Counts and recent activity
    pub fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            stats: self.registry.stats()?,
            jobs: self.ledger.count_by_status()?,
            recent: self.registry.recent(10)?,
            errored: self.registry.errored(10)?,
            last_digest: self.digest_log.recent(1)?.into_iter().next(),
        })
    }

    /// Ledger rows, for one item or the most recent overall
    pub fn jobs(&self, item_id: Option<i64>, limit: usize) -> Result<Vec<Job>> {
        let jobs = match item_id {
            Some(id) => self.ledger.jobs_for_item(id)?,
            None => self.ledger.recent(limit)?,
        };
        Ok(jobs)
    }
}

/// HTML renderer with the configured template, or the built-in page
fn build_renderer(settings: &Settings) -> HtmlRenderer {
    let Some(path) = settings.digest_template.as_deref() else {
        return HtmlRenderer::new();
    };
    match HtmlRenderer::from_file(path) {
        Ok(renderer) => renderer,
        Err(e) => {
            warn!(error = %format!("{:#}", e), "Falling back to the built-in digest page");
            HtmlRenderer::new()
        }
    }
}

/// Channels that are enabled and usable. Misconfigured ones are skipped.
fn build_channels(settings: &Settings) -> Result<Vec<DeliveryChannel>> {
    let mut channels = Vec::new();

    let email = &settings.channels.email;
    if email.enabled {
        match SmtpMailer::new(email) {
            Ok(mailer) => channels.push(DeliveryChannel {
                kind: ChannelKind::Email,
                dispatcher: FanoutDispatcher::new(Arc::new(mailer)),
                recipients: email.recipients.clone(),
            }),
            Err(e) => warn!(error = %format!("{:#}", e), "Email enabled but not usable"),
        }
    }

    let telegram = &settings.channels.telegram;
    if telegram.enabled {
        match telegram.bot_token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => channels.push(DeliveryChannel {
                kind: ChannelKind::Telegram,
                dispatcher: FanoutDispatcher::new(Arc::new(TelegramClient::new(token.to_string()))),
                recipients: telegram.chat_ids.clone(),
            }),
            None => warn!("Telegram enabled but no bot token set (TELEGRAM_BOT_TOKEN)"),
        }
    }

    let webhook = &settings.channels.webhook;
    if webhook.enabled {
        match webhook.endpoint.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => {
                let client = WebhookClient::new(
                    endpoint.to_string(),
                    webhook.token.clone(),
                    Duration::from_secs(webhook.timeout_secs),
                )?;
                channels.push(DeliveryChannel {
                    kind: ChannelKind::Webhook,
                    dispatcher: FanoutDispatcher::new(Arc::new(client)),
                    recipients: webhook.recipients.clone(),
                });
            }
            None => warn!("Webhook enabled but no endpoint configured"),
        }
    }

    Ok(channels)
}

/// Next daily send time strictly after `now`, in UTC
pub fn next_digest_at(now: DateTime<Utc>, send_time: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(send_time).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmailSettings, TelegramSettings, WebhookSettings};
    use chrono::TimeZone;
    use std::io::Write;

    #[test]
    fn test_next_digest_at() {
        let eight = NaiveTime::from_hms_opt(8, 0, 0).unwrap();

        let before = Utc.with_ymd_and_hms(2024, 5, 2, 7, 59, 0).unwrap();
        assert_eq!(
            next_digest_at(before, eight),
            Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap()
        );

        let exactly = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        assert_eq!(
            next_digest_at(exactly, eight),
            Utc.with_ymd_and_hms(2024, 5, 3, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_misconfigured_channels_are_skipped() {
        let mut settings = Settings::with_home("/tmp/podcast-agent-test");
        settings.channels.telegram = TelegramSettings {
            enabled: true,
            bot_token: None,
            chat_ids: vec!["1".to_string()],
        };
        settings.channels.webhook = WebhookSettings {
            enabled: true,
            endpoint: Some("http://localhost:9/digest".to_string()),
            recipients: vec!["a@example.com".to_string()],
            ..WebhookSettings::default()
        };

        settings.channels.email = EmailSettings {
            enabled: true,
            smtp_server: None,
            ..EmailSettings::default()
        };

        let channels = build_channels(&settings).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].kind, ChannelKind::Webhook);
    }

    #[tokio::test]
    async fn test_email_channel_comes_first() {
        let mut settings = Settings::with_home("/tmp/podcast-agent-test");
        settings.channels.email = EmailSettings {
            enabled: true,
            smtp_server: Some("smtp.example.com".to_string()),
            username: Some("digest@example.com".to_string()),
            password: Some("secret".to_string()),
            recipients: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            ..EmailSettings::default()
        };
        settings.channels.telegram = TelegramSettings {
            enabled: true,
            bot_token: Some("123:abc".to_string()),
            chat_ids: vec!["42".to_string()],
        };

        let channels = build_channels(&settings).unwrap();
        let kinds: Vec<_> = channels.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChannelKind::Email, ChannelKind::Telegram]);
        assert_eq!(channels[0].recipients.len(), 2);
    }

    #[test]
    fn test_renderer_uses_configured_template() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("digest.html");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "<main>{{{{episode_count}}}} {{{{episodes}}}}</main>").unwrap();

        let mut settings = Settings::with_home(temp.path());
        settings.digest_template = Some(path);
        let html = build_renderer(&settings).render_html(&[], Utc::now());
        assert_eq!(html, "<main>0 </main>");

        settings.digest_template = Some(temp.path().join("missing.html"));
        let html = build_renderer(&settings).render_html(&[], Utc::now());
        assert!(html.starts_with("<!DOCTYPE html>"));
    }
}
