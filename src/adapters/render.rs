//! Plain-text digest rendering.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use super::DigestRenderer;
use crate::domain::{DigestEntry, DigestPayload};

const SEPARATOR: &str = "--------------------------------------------------";

/// Renders a digest as a plain-text message body
#[derive(Debug, Default, Clone)]
pub struct PlainTextRenderer;

impl PlainTextRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Subject line for a digest sent on `date`
    pub fn subject(date: DateTime<Utc>) -> String {
        format!("Podcast Digest - {}", date.format("%B %-d, %Y"))
    }
}

impl DigestRenderer for PlainTextRenderer {
    fn render(&self, entries: &[DigestEntry], generated_at: DateTime<Utc>) -> DigestPayload {
        let subject = Self::subject(generated_at);
        if entries.is_empty() {
            return DigestPayload {
                subject,
                body: String::new(),
                html: None,
                entry_count: 0,
            };
        }

        let words: u64 = entries
            .iter()
            .filter_map(|e| e.item.transcript_word_count)
            .sum();
        let minutes: f64 = entries
            .iter()
            .filter_map(|e| e.item.transcript_duration)
            .sum::<f64>()
            / 60.0;

        // Transports carry the subject separately
        let mut body = String::new();
        let _ = writeln!(body, "{} episodes processed", entries.len());
        let _ = writeln!(body, "{} words transcribed", words);
        let _ = writeln!(body, "{:.0} minutes of content", minutes);
        let _ = writeln!(body);
        let _ = writeln!(body, "{}", SEPARATOR);

        for entry in entries {
            render_entry(&mut body, entry);
        }

        let _ = writeln!(body);
        let _ = write!(body, "Generated by podcast-agent");

        DigestPayload {
            subject,
            body,
            html: None,
            entry_count: entries.len(),
        }
    }
}

fn render_entry(body: &mut String, entry: &DigestEntry) {
    let item = &entry.item;

    let _ = writeln!(body);
    let _ = writeln!(body, "{}", item.title);
    let _ = writeln!(body, "Podcast: {}", item.podcast);
    if let Some(duration) = item.transcript_duration {
        let _ = writeln!(body, "Duration: {:.0} min", duration / 60.0);
    }
    let _ = writeln!(body, "Published: {}", item.published_at.format("%Y-%m-%d"));

    match &entry.summary {
        Some(summary) => {
            let _ = writeln!(body);
            let _ = writeln!(body, "Executive Summary:");
            let _ = writeln!(body, "{}", summary.executive_summary.trim());

            if !summary.key_points.is_empty() {
                let _ = writeln!(body);
                let _ = writeln!(body, "Key Points:");
                for (i, point) in summary.key_points.iter().enumerate() {
                    let _ = writeln!(body, "{}. {}", i + 1, point);
                }
            }

            if !summary.topics.is_empty() {
                let _ = writeln!(body);
                let _ = writeln!(body, "Topics: {}", summary.topics.join(", "));
            }

            let _ = writeln!(body);
            let _ = writeln!(
                body,
                "Sentiment: {}",
                summary.sentiment.as_str().to_uppercase()
            );
        }
        None => {
            let _ = writeln!(body);
            let _ = writeln!(body, "(summary unavailable)");
        }
    }

    if let Some(url) = &item.episode_url {
        let _ = writeln!(body, "Listen: {}", url);
    }
    let _ = writeln!(body, "{}", SEPARATOR);
}
