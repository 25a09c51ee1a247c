//! Whisper transcription backend.
//!
//! Shells out to a local whisper binary, then writes a transcript document
//! to `<transcript_dir>/episode_<id>_transcript.json`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use super::StageExecutor;
use crate::config::WhisperSettings;
use crate::domain::{Item, StageFailure, StageOutput};

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    language_probability: Option<f64>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    text: String,
}

/// One timed span of the transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Transcript artifact as written to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptDocument {
    pub language: String,
    pub language_probability: f64,
    /// Seconds
    pub duration: f64,
    pub segments: Vec<TranscriptSegment>,
    pub full_transcript: String,
    pub word_count: u64,
    pub audio_path: String,
}

impl TranscriptDocument {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read transcript: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse transcript: {}", path.display()))
    }
}

/// Transcription stage executor backed by the whisper CLI
pub struct WhisperTranscriber {
    settings: WhisperSettings,
    transcript_dir: PathBuf,
}

impl WhisperTranscriber {
    pub fn new(settings: WhisperSettings, transcript_dir: PathBuf) -> Self {
        Self {
            settings,
            transcript_dir,
        }
    }

    /// Transcribe audio using the configured whisper binary
    pub async fn transcribe(&self, audio_path: &Path) -> Result<TranscriptDocument> {
        // Create temp dir for output
        let temp_dir = tempfile::tempdir().context("Failed to create temp dir")?;

        let mut command = Command::new(&self.settings.binary);
        command
            .arg(audio_path)
            .arg("--model")
            .arg(&self.settings.model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json");
        if let Some(language) = &self.settings.language {
            command.arg("--language").arg(language);
        }

        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run whisper ({})", self.settings.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Whisper failed: {}", stderr.trim());
        }

        // Find and parse JSON output
        let stem = audio_path.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));

        let json_content = tokio::fs::read_to_string(&json_path)
            .await
            .context("Failed to read whisper output")?;

        let whisper: WhisperOutput =
            serde_json::from_str(&json_content).context("Failed to parse whisper JSON")?;

        Ok(self.to_document(whisper, audio_path))
    }

    fn to_document(&self, whisper: WhisperOutput, audio_path: &Path) -> TranscriptDocument {
        let duration = whisper.segments.last().map(|s| s.end).unwrap_or(0.0);
        let full_transcript = whisper.text.trim().to_string();
        let word_count = full_transcript.split_whitespace().count() as u64;

        let forced = self.settings.language.clone();
        let language = if whisper.language.is_empty() {
            forced.clone().unwrap_or_else(|| "en".to_string())
        } else {
            whisper.language
        };
        // A forced language is certain; otherwise take what the tool reports
        let language_probability = match (forced, whisper.language_probability) {
            (_, Some(p)) => p,
            (Some(_), None) => 1.0,
            (None, None) => 0.0,
        };

        TranscriptDocument {
            language,
            language_probability,
            duration,
            segments: whisper
                .segments
                .into_iter()
                .map(|s| TranscriptSegment {
                    start: s.start,
                    end: s.end,
                    text: s.text.trim().to_string(),
                })
                .collect(),
            full_transcript,
            word_count,
            audio_path: audio_path.display().to_string(),
        }
    }

    /// Save transcript to file and return the file path
    async fn save(&self, item_id: i64, document: &TranscriptDocument) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.transcript_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create transcript directory: {}",
                    self.transcript_dir.display()
                )
            })?;

        let path = transcript_path(&self.transcript_dir, item_id);
        let json = serde_json::to_string_pretty(document).context("Failed to serialize transcript")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write transcript: {}", path.display()))?;
        Ok(path)
    }
}

/// Where the transcript for an item is written
pub fn transcript_path(transcript_dir: &Path, item_id: i64) -> PathBuf {
    transcript_dir.join(format!("episode_{}_transcript.json", item_id))
}

#[async_trait]
impl StageExecutor for WhisperTranscriber {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn execute(&self, item: &Item) -> Result<StageOutput, StageFailure> {
        let audio_path = item
            .audio_file_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| StageFailure::Permanent("item has no audio file".to_string()))?;

        if !audio_path.exists() {
            return Err(StageFailure::Permanent(format!(
                "audio file not found: {}",
                audio_path.display()
            )));
        }

        debug!(item_id = item.id, audio = %audio_path.display(), "Transcribing");
        let document = self
            .transcribe(&audio_path)
            .await
            .map_err(|e| StageFailure::Executor(format!("{:#}", e)))?;

        let path = self
            .save(item.id, &document)
            .await
            .map_err(|e| StageFailure::Transient(format!("{:#}", e)))?;

        info!(
            item_id = item.id,
            words = document.word_count,
            segments = document.segments.len(),
            "Transcription completed"
        );

        Ok(StageOutput::Transcribed {
            transcript_path: path.display().to_string(),
            word_count: document.word_count,
            duration_secs: document.duration,
            language: document.language,
            language_probability: document.language_probability,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcriber(language: Option<&str>) -> WhisperTranscriber {
        WhisperTranscriber::new(
            WhisperSettings {
                binary: "whisper".to_string(),
                model: "base".to_string(),
                language: language.map(str::to_string),
            },
            PathBuf::from("/tmp/transcripts"),
        )
    }

    #[test]
    fn test_document_from_whisper_output() {
        let raw = r#"{
            "text": " Hello there. General Kenobi. ",
            "language": "en",
            "segments": [
                {"start": 0.0, "end": 1.5, "text": " Hello there."},
                {"start": 1.5, "end": 3.25, "text": " General Kenobi."}
            ]
        }"#;
        let output: WhisperOutput = serde_json::from_str(raw).unwrap();
        let doc = transcriber(Some("en")).to_document(output, Path::new("/a/ep.mp3"));

        assert_eq!(doc.full_transcript, "Hello there. General Kenobi.");
        assert_eq!(doc.word_count, 4);
        assert_eq!(doc.duration, 3.25);
        assert_eq!(doc.language_probability, 1.0);
        assert_eq!(doc.segments[1].text, "General Kenobi.");
    }

    #[test]
    fn test_detected_language_without_probability() {
        let output: WhisperOutput =
            serde_json::from_str(r#"{"text": "hola", "language": "es"}"#).unwrap();
        let doc = transcriber(None).to_document(output, Path::new("/a/ep.mp3"));

        assert_eq!(doc.language, "es");
        assert_eq!(doc.language_probability, 0.0);
        assert_eq!(doc.duration, 0.0);
    }

    #[tokio::test]
    async fn test_missing_audio_is_permanent() {
        let item = crate::test_support::item_with(|item| {
            item.audio_file_path = Some("/definitely/not/here.mp3".to_string());
        });
        let err = transcriber(None).execute(&item).await.unwrap_err();
        assert!(matches!(err, StageFailure::Permanent(_)));
    }

    #[test]
    fn test_transcript_path() {
        assert_eq!(
            transcript_path(Path::new("/t"), 7),
            PathBuf::from("/t/episode_7_transcript.json")
        );
    }
}
