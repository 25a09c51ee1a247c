//! Episodes tracked by the registry and the stages they move through.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A processing stage with a predecessor-artifact precondition.
///
/// Stages run in declaration order; each consumes the artifact produced by
/// the one before it (download consumes the item's source locator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Download,
    Transcription,
    Summarization,
}

impl StageKind {
    /// All stages in pipeline order
    pub const ALL: [StageKind; 3] = [
        StageKind::Download,
        StageKind::Transcription,
        StageKind::Summarization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Transcription => "transcription",
            Self::Summarization => "summarization",
        }
    }

    /// The stage whose artifact this stage consumes
    pub fn predecessor(&self) -> Option<StageKind> {
        match self {
            Self::Download => None,
            Self::Transcription => Some(Self::Download),
            Self::Summarization => Some(Self::Transcription),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "transcription" | "transcribe" => Ok(Self::Transcription),
            "summarization" | "summarize" => Ok(Self::Summarization),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

/// An episode as produced by acquisition, before it has a registry id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    /// Stable external identity (feed entry id)
    pub guid: String,

    /// Name of the podcast the episode belongs to
    pub podcast: String,

    pub title: String,

    pub description: Option<String>,

    /// Source locator for the download stage
    pub audio_url: String,

    pub episode_url: Option<String>,

    pub published_at: DateTime<Utc>,

    /// Enclosure size advertised by the feed
    pub file_size: Option<u64>,
}

/// One tracked episode and its per-stage completion markers.
///
/// This is the only representation of an episode: executors, the registry,
/// the digest and the tests all use it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub guid: String,
    pub podcast: String,
    pub title: String,
    pub description: Option<String>,
    pub audio_url: String,
    pub episode_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,

    // Download
    pub downloaded: bool,
    pub audio_file_path: Option<String>,
    pub file_size: Option<u64>,
    pub download_started_at: Option<DateTime<Utc>>,
    pub download_completed_at: Option<DateTime<Utc>>,

    // Transcription
    pub transcribed: bool,
    pub transcript_file_path: Option<String>,
    pub transcript_word_count: Option<u64>,
    pub transcript_duration: Option<f64>,
    pub transcript_language: Option<String>,
    pub transcript_language_probability: Option<f64>,
    pub transcription_started_at: Option<DateTime<Utc>>,
    pub transcription_completed_at: Option<DateTime<Utc>>,

    // Summarization
    pub summarized: bool,
    pub summary_file_path: Option<String>,
    pub summarization_started_at: Option<DateTime<Utc>>,
    pub summarization_completed_at: Option<DateTime<Utc>>,

    /// Error from the most recent failed stage attempt
    pub last_error: Option<String>,

    /// Number of failed stage attempts. Recorded, never consulted.
    pub retry_count: u32,
}

impl Item {
    /// Artifact reference produced by a stage, if that stage has completed
    pub fn artifact(&self, stage: StageKind) -> Option<&str> {
        match stage {
            StageKind::Download => self.audio_file_path.as_deref(),
            StageKind::Transcription => self.transcript_file_path.as_deref(),
            StageKind::Summarization => self.summary_file_path.as_deref(),
        }
    }

    /// Completion timestamp of a stage
    pub fn completed_at(&self, stage: StageKind) -> Option<DateTime<Utc>> {
        match stage {
            StageKind::Download => self.download_completed_at,
            StageKind::Transcription => self.transcription_completed_at,
            StageKind::Summarization => self.summarization_completed_at,
        }
    }

    pub fn is_stage_complete(&self, stage: StageKind) -> bool {
        self.artifact(stage).is_some()
    }
}

/// Sentiment label attached to a summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
    Mixed,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Mixed => "mixed",
        }
    }

    /// Lenient parse for model output; anything unknown is neutral
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Self::Positive,
            "negative" => Self::Negative,
            "mixed" => Self::Mixed,
            _ => Self::Neutral,
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A notable moment in an episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    /// Approximate position, e.g. "12:34"
    pub timestamp: String,
    pub text: String,
    #[serde(default)]
    pub context: Option<String>,
}

/// Structured output of the summarization stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub executive_summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub highlights: Vec<Highlight>,
    #[serde(default)]
    pub sentiment: Sentiment,
}

impl SummaryRecord {
    /// Summary carrying only free text, used when model output has no structure
    pub fn narrative_only(text: impl Into<String>) -> Self {
        Self {
            executive_summary: text.into(),
            key_points: Vec::new(),
            topics: Vec::new(),
            highlights: Vec::new(),
            sentiment: Sentiment::Neutral,
        }
    }

    pub fn word_count(&self) -> usize {
        self.executive_summary.split_whitespace().count()
    }
}

/// Successful result of one stage executor call
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Downloaded {
        audio_path: String,
        file_size: u64,
    },
    Transcribed {
        transcript_path: String,
        word_count: u64,
        duration_secs: f64,
        language: String,
        language_probability: f64,
    },
    Summarized {
        summary_path: String,
        summary: SummaryRecord,
        model_used: String,
    },
}

impl StageOutput {
    /// The stage this output completes
    pub fn stage(&self) -> StageKind {
        match self {
            Self::Downloaded { .. } => StageKind::Download,
            Self::Transcribed { .. } => StageKind::Transcription,
            Self::Summarized { .. } => StageKind::Summarization,
        }
    }

    /// The artifact reference carried by this output
    pub fn artifact(&self) -> &str {
        match self {
            Self::Downloaded { audio_path, .. } => audio_path,
            Self::Transcribed {
                transcript_path, ..
            } => transcript_path,
            Self::Summarized { summary_path, .. } => summary_path,
        }
    }

    /// One-line description for the job ledger
    pub fn describe(&self) -> String {
        match self {
            Self::Downloaded { file_size, .. } => format!("Downloaded {} bytes", file_size),
            Self::Transcribed { word_count, .. } => format!("Transcribed {} words", word_count),
            Self::Summarized { summary, .. } => format!(
                "Generated summary with {} key points",
                summary.key_points.len()
            ),
        }
    }
}
