//! Ollama summarization stage.
//!
//! Builds a summary prompt from the transcript document, calls Ollama's chat
//! API and extracts a JSON summary from the reply. Replies without usable
//! JSON fall back to a narrative-only summary holding the raw text.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::whisper::TranscriptDocument;
use super::StageExecutor;
use crate::config::LlmSettings;
use crate::domain::{Highlight, Item, Sentiment, StageFailure, StageOutput, SummaryRecord};

/// Summarization stage executor backed by a local Ollama server
pub struct OllamaSummarizer {
    client: reqwest::Client,
    settings: LlmSettings,
    summary_dir: PathBuf,
}

impl OllamaSummarizer {
    pub fn new(settings: LlmSettings, summary_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            settings,
            summary_dir,
        })
    }

    fn base_url(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    /// Send one chat turn and return the reply text
    async fn chat(&self, prompt: &str) -> Result<String, StageFailure> {
        let url = format!("{}/api/chat", self.base_url());
        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
            options: ChatOptions {
                temperature: self.settings.temperature,
                top_p: 0.9,
                num_predict: 2048,
            },
        };

        debug!(model = %self.settings.model, prompt_len = prompt.len(), "Sending request to Ollama");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| StageFailure::Transient(format!("Failed to call Ollama: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StageFailure::Executor(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| StageFailure::Executor(format!("Failed to parse Ollama response: {}", e)))?;

        Ok(reply.message.content)
    }

    async fn save(&self, item_id: i64, summary: &SummaryRecord) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.summary_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create summary directory: {}",
                    self.summary_dir.display()
                )
            })?;

        let path = summary_path(&self.summary_dir, item_id);
        let document = SummaryDocument {
            episode_id: item_id,
            generated_at: Utc::now().to_rfc3339(),
            model_used: &self.settings.model,
            summary_data: summary,
        };
        let json = serde_json::to_string_pretty(&document).context("Failed to serialize summary")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write summary: {}", path.display()))?;
        Ok(path)
    }
}

#[async_trait]
impl StageExecutor for OllamaSummarizer {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn execute(&self, item: &Item) -> Result<StageOutput, StageFailure> {
        let transcript_path = item
            .transcript_file_path
            .as_deref()
            .ok_or_else(|| StageFailure::Permanent("item has no transcript".to_string()))?;

        let transcript = TranscriptDocument::load(Path::new(transcript_path))
            .await
            .map_err(|e| StageFailure::Permanent(format!("{:#}", e)))?;

        let prompt = build_prompt(&transcript, &item.title, self.settings.transcript_char_limit);
        let reply = self.chat(&prompt).await?;

        let summary = match extract_json_from_response(&reply) {
            Some(value) => summary_from_value(&value, &reply),
            None => {
                warn!(item_id = item.id, "No JSON in model reply, keeping raw text");
                SummaryRecord::narrative_only(reply.trim())
            }
        };

        let path = self
            .save(item.id, &summary)
            .await
            .map_err(|e| StageFailure::Transient(format!("{:#}", e)))?;

        info!(
            item_id = item.id,
            key_points = summary.key_points.len(),
            "Summary generated"
        );

        Ok(StageOutput::Summarized {
            summary_path: path.display().to_string(),
            summary,
            model_used: self.settings.model.clone(),
        })
    }
}

/// Where the summary for an item is written
pub fn summary_path(summary_dir: &Path, item_id: i64) -> PathBuf {
    summary_dir.join(format!("episode_{}_summary.json", item_id))
}

/// Prompt asking for a JSON summary of the (possibly truncated) transcript
pub fn build_prompt(transcript: &TranscriptDocument, title: &str, char_limit: usize) -> String {
    let excerpt: String = transcript.full_transcript.chars().take(char_limit).collect();

    format!(
        r#"You are an AI assistant tasked with creating a comprehensive summary of a podcast episode about AI and technology.

Episode Title: {title}
Duration: {duration:.1} seconds
Word Count: {words} words

Please analyze the following transcript and provide:
1. Executive Summary (2-3 paragraphs): A high-level overview of the main topics, key insights, and value of this episode.
2. Key Points (5-8 bullet points): The most important takeaways or actionable advice.
3. Topics Discussed (list): Main themes, technologies, or concepts covered.
4. Highlights (3-5 items): Notable quotes or moments with approximate timestamps.
5. Sentiment: Overall tone (positive, negative, neutral, or mixed).

Please format your response as JSON with the following structure:
{{
    "executive_summary": "detailed summary here",
    "key_points": ["point 1", "point 2", "point 3"],
    "topics": ["topic 1", "topic 2", "topic 3"],
    "highlights": [
        {{"timestamp": "00:00", "text": "highlight text", "context": "brief context"}}
    ],
    "sentiment": "positive/negative/neutral/mixed"
}}

Transcript:
{excerpt}
"#,
        title = title,
        duration = transcript.duration,
        words = transcript.word_count,
        excerpt = excerpt,
    )
}

/// Build a summary from loosely-shaped model JSON
fn summary_from_value(value: &Value, raw: &str) -> SummaryRecord {
    let executive_summary = value
        .get("executive_summary")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| raw.trim().to_string());

    SummaryRecord {
        executive_summary,
        key_points: string_list(value.get("key_points")),
        topics: string_list(value.get("topics")),
        highlights: value
            .get("highlights")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|h| serde_json::from_value::<Highlight>(h.clone()).ok())
                    .collect()
            })
            .unwrap_or_default(),
        sentiment: value
            .get("sentiment")
            .and_then(Value::as_str)
            .map(Sentiment::parse_lenient)
            .unwrap_or_default(),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Extract JSON from LLM response (handles markdown code blocks)
fn extract_json_from_response(response: &str) -> Option<Value> {
    let trimmed = response.trim();

    // Try direct parse first
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        return Some(json).filter(Value::is_object);
    }

    // Try to extract from markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after_marker = &trimmed[start + 7..];
        if let Some(end) = after_marker.find("```") {
            if let Ok(json) = serde_json::from_str::<Value>(after_marker[..end].trim()) {
                return Some(json);
            }
        }
    }

    // Try to find a JSON object in the response
    let start = trimmed.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in trimmed[start..].char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + c.len_utf8();
                    return serde_json::from_str::<Value>(&trimmed[start..end]).ok();
                }
            }
            _ => {}
        }
    }

    None
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    top_p: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct SummaryDocument<'a> {
    episode_id: i64,
    generated_at: String,
    model_used: &'a str,
    summary_data: &'a SummaryRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(text: &str) -> TranscriptDocument {
        TranscriptDocument {
            language: "en".to_string(),
            language_probability: 1.0,
            duration: 120.0,
            segments: Vec::new(),
            full_transcript: text.to_string(),
            word_count: text.split_whitespace().count() as u64,
            audio_path: "/a.mp3".to_string(),
        }
    }

    #[test]
    fn test_extract_json_from_response() {
        // Direct JSON
        assert!(extract_json_from_response(r#"{"executive_summary": "x"}"#).is_some());

        // Markdown code block
        let json = extract_json_from_response(
            r#"Here's the summary:
```json
{"key_points": ["a", "b"]}
```
"#,
        );
        assert!(json.is_some());

        // JSON embedded in text, with a brace inside a string
        let json = extract_json_from_response(
            r#"Sure! {"executive_summary": "uses {braces}", "sentiment": "mixed"} Hope that helps."#,
        )
        .unwrap();
        assert_eq!(json["sentiment"], "mixed");

        assert!(extract_json_from_response("no json here").is_none());
    }

    #[test]
    fn test_summary_from_loose_json() {
        let value: Value = serde_json::from_str(
            r#"{
                "executive_summary": "An episode about agents.",
                "key_points": ["Agents need tools", 42, null, ""],
                "topics": ["agents"],
                "highlights": [
                    {"timestamp": "01:02", "text": "Quote", "context": "intro"},
                    {"text": "missing timestamp"}
                ],
                "sentiment": "Positive"
            }"#,
        )
        .unwrap();

        let summary = summary_from_value(&value, "raw");
        assert_eq!(summary.executive_summary, "An episode about agents.");
        assert_eq!(summary.key_points, vec!["Agents need tools", "42"]);
        assert_eq!(summary.highlights.len(), 1);
        assert_eq!(summary.sentiment, Sentiment::Positive);
    }

    #[test]
    fn test_prompt_truncates_transcript() {
        let doc = transcript(&"word ".repeat(5000));
        let prompt = build_prompt(&doc, "Ep 1", 100);

        assert!(prompt.contains("Episode Title: Ep 1"));
        assert!(prompt.contains("Word Count: 5000 words"));
        let excerpt = prompt.split("Transcript:\n").nth(1).unwrap();
        assert_eq!(excerpt.trim_end().chars().count(), 99);
    }

    #[tokio::test]
    async fn test_missing_transcript_is_permanent() {
        let summarizer =
            OllamaSummarizer::new(LlmSettings::default(), PathBuf::from("/tmp/summaries")).unwrap();
        let item = crate::test_support::item_with(|item| {
            item.transcript_file_path = Some("/nope/transcript.json".to_string());
        });

        let err = summarizer.execute(&item).await.unwrap_err();
        assert!(matches!(err, StageFailure::Permanent(_)));
    }
}
