//! Configuration for podcast-agent.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PODCAST_AGENT_HOME, PODCAST_AGENT_DB, WHISPER_PATH,
//!    OLLAMA_URL, TELEGRAM_BOT_TOKEN, WEBHOOK_TOKEN, EMAIL_PASSWORD)
//! 2. Config file (.podcast-agent/config.yaml)
//! 3. Defaults (~/.podcast-agent)
//!
//! Config file discovery:
//! - Searches current directory and parents for .podcast-agent/config.yaml
//! - `paths.home` is relative to the .podcast-agent/ directory
//! - Other paths in the file are relative to the project root (its parent)
//!
//! The resolved [`Settings`] is handed to the orchestrator explicitly; nothing
//! is cached globally.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::domain::StageKind;

const CONFIG_DIR: &str = ".podcast-agent";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub feeds: Vec<FeedSource>,
    #[serde(default)]
    pub max_entries_per_feed: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub whisper: Option<WhisperSettings>,
    #[serde(default)]
    pub llm: Option<LlmSettings>,
    #[serde(default)]
    pub digest: Option<DigestSettings>,
    #[serde(default)]
    pub channels: Option<ChannelSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .podcast-agent/)
    pub home: Option<String>,
    /// SQLite file (relative to the project root)
    pub database: Option<String>,
    pub audio: Option<String>,
    pub transcripts: Option<String>,
    pub summaries: Option<String>,
    /// HTML page template for mailed digests
    pub digest_template: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StagesConfig {
    pub download: Option<StageSettings>,
    pub transcription: Option<StageSettings>,
    pub summarization: Option<StageSettings>,
}

/// A podcast feed to poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
}

/// Per-stage pool settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Executor calls allowed in flight at once
    pub concurrency: usize,
    /// Cap on items taken per run (unbounded when absent)
    #[serde(default)]
    pub batch_limit: Option<usize>,
}

impl StageSettings {
    pub fn default_for(stage: StageKind) -> Self {
        let concurrency = match stage {
            StageKind::Download => 3,
            StageKind::Transcription => 2,
            StageKind::Summarization => 2,
        };
        Self {
            concurrency,
            batch_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperSettings {
    /// Binary to invoke
    pub binary: String,
    pub model: String,
    pub language: Option<String>,
}

impl Default for WhisperSettings {
    fn default() -> Self {
        Self {
            binary: "whisper".to_string(),
            model: "base".to_string(),
            language: Some("en".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Ollama server
    pub base_url: String,
    pub model: String,
    /// Transcripts longer than this are truncated before prompting
    pub transcript_char_limit: usize,
    pub timeout_secs: u64,
    pub temperature: f32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            transcript_char_limit: 8000,
            timeout_secs: 300,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestSettings {
    /// Trailing window, in hours, of summaries included in a digest
    pub window_hours: u32,
    /// Daily send time, UTC, `HH:MM`
    pub send_time: String,
    /// Pipeline cadence in daemon mode
    pub feed_check_interval_hours: u32,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            window_hours: 25,
            send_time: "08:00".to_string(),
            feed_check_interval_hours: 6,
        }
    }
}

impl DigestSettings {
    pub fn send_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.send_time, "%H:%M")
            .with_context(|| format!("Invalid digest send_time '{}', expected HH:MM", self.send_time))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub email: EmailSettings,
    pub telegram: TelegramSettings,
    pub webhook: WebhookSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub enabled: bool,
    pub smtp_server: Option<String>,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sender mailbox; the username when absent
    pub from: Option<String>,
    pub recipients: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_server: None,
            smtp_port: 587,
            username: None,
            password: None,
            from: None,
            recipients: Vec::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub token: Option<String>,
    /// Forwarded in the request body, one request per recipient
    pub recipients: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            token: None,
            recipients: Vec::new(),
            timeout_secs: 30,
        }
    }
}

/// Fully resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// State directory
    pub home: PathBuf,
    pub database_path: PathBuf,
    pub audio_dir: PathBuf,
    pub transcript_dir: PathBuf,
    pub summary_dir: PathBuf,
    /// Custom HTML digest page, if configured
    pub digest_template: Option<PathBuf>,

    pub feeds: Vec<FeedSource>,
    pub max_entries_per_feed: usize,

    /// Stored on ledger rows, never enforced
    pub max_retries: u32,
    pub download: StageSettings,
    pub transcription: StageSettings,
    pub summarization: StageSettings,
    pub download_timeout_secs: u64,

    pub whisper: WhisperSettings,
    pub llm: LlmSettings,
    pub digest: DigestSettings,
    pub channels: ChannelSettings,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Settings {
    /// Load from the discovered config file and the process environment
    pub fn load() -> Result<Self> {
        Self::load_from(find_config_file(), |key| std::env::var(key).ok())
    }

    /// Load from an explicit config file and an environment lookup
    pub fn load_from(
        config_file: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = match config_file.as_deref() {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };

        let home = match env("PODCAST_AGENT_HOME") {
            Some(home) => PathBuf::from(home),
            None => match (config_file.as_deref(), file.paths.home.as_deref()) {
                (Some(config_path), Some(home_path)) => {
                    let config_dir = config_path.parent().unwrap_or(Path::new("."));
                    resolve_path(config_dir, home_path)
                }
                _ => default_home()?,
            },
        };

        // Base directory is the parent of .podcast-agent/ (i.e., grandparent of config.yaml)
        let base_dir = config_file
            .as_deref()
            .and_then(|p| p.parent())
            .and_then(|p| p.parent())
            .map(Path::to_path_buf);
        let resolve = |configured: Option<&str>, fallback: &str| -> PathBuf {
            match (configured, base_dir.as_deref()) {
                (Some(path), Some(base)) => resolve_path(base, path),
                (Some(path), None) => PathBuf::from(path),
                (None, _) => home.join(fallback),
            }
        };

        let database_path = match env("PODCAST_AGENT_DB") {
            Some(db) => PathBuf::from(db),
            None => resolve(file.paths.database.as_deref(), "db.sqlite"),
        };
        let audio_dir = resolve(file.paths.audio.as_deref(), "audio");
        let transcript_dir = resolve(file.paths.transcripts.as_deref(), "transcripts");
        let summary_dir = resolve(file.paths.summaries.as_deref(), "summaries");
        let digest_template = file
            .paths
            .digest_template
            .as_deref()
            .map(|path| resolve(Some(path), path));

        let mut whisper = file.whisper.unwrap_or_default();
        if let Some(binary) = env("WHISPER_PATH") {
            whisper.binary = binary;
        }

        let mut llm = file.llm.unwrap_or_default();
        if let Some(url) = env("OLLAMA_URL") {
            llm.base_url = url;
        }

        let mut channels = file.channels.unwrap_or_default();
        if let Some(token) = env("TELEGRAM_BOT_TOKEN") {
            channels.telegram.bot_token = Some(token);
        }
        if let Some(token) = env("WEBHOOK_TOKEN") {
            channels.webhook.token = Some(token);
        }
        if let Some(password) = env("EMAIL_PASSWORD") {
            channels.email.password = Some(password);
        }

        let settings = Self {
            database_path,
            audio_dir,
            transcript_dir,
            summary_dir,
            digest_template,
            feeds: file.feeds,
            max_entries_per_feed: file.max_entries_per_feed.unwrap_or(10),
            max_retries: file.max_retries.unwrap_or(3),
            download: file
                .stages
                .download
                .unwrap_or_else(|| StageSettings::default_for(StageKind::Download)),
            transcription: file
                .stages
                .transcription
                .unwrap_or_else(|| StageSettings::default_for(StageKind::Transcription)),
            summarization: file
                .stages
                .summarization
                .unwrap_or_else(|| StageSettings::default_for(StageKind::Summarization)),
            download_timeout_secs: 300,
            whisper,
            llm,
            digest: file.digest.unwrap_or_default(),
            channels,
            config_file,
            home,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Defaults rooted at `home`, ignoring files and environment
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            database_path: home.join("db.sqlite"),
            audio_dir: home.join("audio"),
            transcript_dir: home.join("transcripts"),
            summary_dir: home.join("summaries"),
            digest_template: None,
            feeds: Vec::new(),
            max_entries_per_feed: 10,
            max_retries: 3,
            download: StageSettings::default_for(StageKind::Download),
            transcription: StageSettings::default_for(StageKind::Transcription),
            summarization: StageSettings::default_for(StageKind::Summarization),
            download_timeout_secs: 300,
            whisper: WhisperSettings::default(),
            llm: LlmSettings::default(),
            digest: DigestSettings::default(),
            channels: ChannelSettings::default(),
            config_file: None,
            home,
        }
    }

    /// Pool settings for one stage
    pub fn stage(&self, stage: StageKind) -> &StageSettings {
        match stage {
            StageKind::Download => &self.download,
            StageKind::Transcription => &self.transcription,
            StageKind::Summarization => &self.summarization,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for stage in StageKind::ALL {
            if self.stage(stage).concurrency == 0 {
                bail!("stages.{}.concurrency must be at least 1", stage);
            }
        }
        if self.digest.window_hours == 0 {
            bail!("digest.window_hours must be at least 1");
        }
        if self.digest.feed_check_interval_hours == 0 {
            bail!("digest.feed_check_interval_hours must be at least 1");
        }
        self.digest.send_time()?;
        if self.channels.email.enabled && self.channels.email.smtp_port == 0 {
            bail!("channels.email.smtp_port must be set");
        }
        Ok(())
    }
}

fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR))
}

/// Find config file by searching current directory and parents
pub fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}
