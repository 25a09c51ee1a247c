//! Shared fixtures for integration tests: temp databases and fake adapters.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use podcast_agent::adapters::{Acquirer, DeliveryError, DeliveryTransport, StageExecutor};
use podcast_agent::core::{Database, ItemRegistry};
use podcast_agent::domain::{
    DigestPayload, Item, NewItem, Sentiment, StageFailure, StageKind, StageOutput, SummaryRecord,
};

/// Database in a fresh temp directory. Keep the `TempDir` alive for the test.
pub fn temp_db() -> (TempDir, Database) {
    let temp = TempDir::new().unwrap();
    let db = Database::open(&temp.path().join("db.sqlite")).unwrap();
    (temp, db)
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap()
}

pub fn new_item(n: usize) -> NewItem {
    NewItem {
        guid: format!("guid-{}", n),
        podcast: "Test Cast".to_string(),
        title: format!("Episode {}", n),
        description: None,
        audio_url: format!("https://cdn.example.com/{}.mp3", n),
        episode_url: None,
        published_at: base_time() + chrono::Duration::minutes(n as i64),
        file_size: None,
    }
}

/// Insert `count` items and return their ids, oldest first
pub fn seed(registry: &ItemRegistry, count: usize) -> Vec<i64> {
    let items: Vec<NewItem> = (0..count).map(new_item).collect();
    registry.insert_new(&items).unwrap();
    items
        .iter()
        .map(|i| registry.get_by_guid(&i.guid).unwrap().unwrap().id)
        .collect()
}

pub fn summary(text: &str) -> SummaryRecord {
    SummaryRecord {
        executive_summary: text.to_string(),
        key_points: vec!["First point".to_string()],
        topics: vec!["testing".to_string()],
        highlights: Vec::new(),
        sentiment: Sentiment::Positive,
    }
}

/// A successful output for `stage`
pub fn output_for(stage: StageKind, item_id: i64) -> StageOutput {
    match stage {
        StageKind::Download => StageOutput::Downloaded {
            audio_path: format!("/audio/{}.mp3", item_id),
            file_size: 1024,
        },
        StageKind::Transcription => StageOutput::Transcribed {
            transcript_path: format!("/transcripts/episode_{}_transcript.json", item_id),
            word_count: 1500,
            duration_secs: 900.0,
            language: "en".to_string(),
            language_probability: 0.98,
        },
        StageKind::Summarization => StageOutput::Summarized {
            summary_path: format!("/summaries/episode_{}_summary.json", item_id),
            summary: summary(&format!("Summary of item {}", item_id)),
            model_used: "fake".to_string(),
        },
    }
}

/// Drive an item through every stage up to and including `last`, with
/// the final stage completing at `completed_at`
pub fn complete_through(
    registry: &ItemRegistry,
    item_id: i64,
    last: StageKind,
    completed_at: DateTime<Utc>,
) {
    for stage in StageKind::ALL {
        let at = if stage == last {
            completed_at
        } else {
            completed_at - chrono::Duration::minutes(10)
        };
        registry
            .record_outcome_at(item_id, stage, at, at, &Ok(output_for(stage, item_id)))
            .unwrap();
        if stage == last {
            break;
        }
    }
}

// ============================================================================
// Fake executors
// ============================================================================

/// Succeeds for every item except the configured ones
pub struct FakeExecutor {
    pub stage: StageKind,
    pub fail: HashSet<i64>,
    pub panic_on: HashSet<i64>,
    pub calls: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            fail: HashSet::new(),
            panic_on: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, item_id: i64) -> Self {
        self.fail.insert(item_id);
        self
    }

    pub fn panicking(mut self, item_id: i64) -> Self {
        self.panic_on.insert(item_id);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for FakeExecutor {
    fn name(&self) -> &str {
        "fake"
    }

    async fn execute(&self, item: &Item) -> Result<StageOutput, StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on.contains(&item.id) {
            panic!("executor blew up on item {}", item.id);
        }
        if self.fail.contains(&item.id) {
            return Err(StageFailure::Transient(format!("item {} unreachable", item.id)));
        }
        Ok(output_for(self.stage, item.id))
    }
}

/// Blocks every call until the test releases it, tracking calls in flight
pub struct GatedExecutor {
    pub stage: StageKind,
    gate: Semaphore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl GatedExecutor {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    /// Let `n` held calls return
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Wait until `cond` holds; false if it never does within a few seconds
    pub async fn wait_until(&self, cond: impl Fn(&Self) -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond(self) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl StageExecutor for GatedExecutor {
    fn name(&self) -> &str {
        "gated"
    }

    async fn execute(&self, item: &Item) -> Result<StageOutput, StageFailure> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        match self.gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(StageFailure::Executor("gate closed".to_string())),
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(output_for(self.stage, item.id))
    }
}

/// Always returns the output of a different stage
pub struct WrongStageExecutor;

#[async_trait]
impl StageExecutor for WrongStageExecutor {
    fn name(&self) -> &str {
        "wrong-stage"
    }

    async fn execute(&self, item: &Item) -> Result<StageOutput, StageFailure> {
        Ok(output_for(StageKind::Summarization, item.id))
    }
}

// ============================================================================
// Fake acquisition and delivery
// ============================================================================

pub struct FakeAcquirer {
    pub items: Vec<NewItem>,
    pub fail: bool,
}

#[async_trait]
impl Acquirer for FakeAcquirer {
    fn name(&self) -> &str {
        "fake-feed"
    }

    async fn acquire(&self) -> anyhow::Result<Vec<NewItem>> {
        if self.fail {
            anyhow::bail!("feed host unreachable");
        }
        Ok(self.items.clone())
    }
}

/// Records deliveries; rejects the configured recipients
#[derive(Default)]
pub struct FakeTransport {
    pub rejecting: HashSet<String>,
    pub sent: Mutex<Vec<(String, DigestPayload)>>,
}

impl FakeTransport {
    pub fn rejecting(recipients: &[&str]) -> Self {
        Self {
            rejecting: recipients.iter().map(|r| r.to_string()).collect(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Recipients that received a payload, in order
    pub fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn payloads(&self) -> Vec<DigestPayload> {
        self.sent.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl DeliveryTransport for FakeTransport {
    fn name(&self) -> &str {
        "fake-transport"
    }

    async fn send(&self, payload: &DigestPayload, recipient: &str) -> Result<(), DeliveryError> {
        if self.rejecting.contains(recipient) {
            return Err(DeliveryError::Rejected(format!("{} bounced", recipient)));
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), payload.clone()));
        Ok(())
    }
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
