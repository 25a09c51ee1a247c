//! HTML digest rendering.
//!
//! Produces the plain-text body through [`PlainTextRenderer`] and adds an
//! HTML alternative for mail. A custom template may supply the page; it is
//! filled through these placeholders:
//!
//! - `{{date}}`
//! - `{{episode_count}}`
//! - `{{word_count}}`
//! - `{{duration_minutes}}`
//! - `{{episodes}}` (required, replaced by the episode cards)

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use super::{DigestRenderer, PlainTextRenderer};
use crate::domain::{DigestEntry, DigestPayload};

const EPISODES_PLACEHOLDER: &str = "{{episodes}}";

/// Renders plain text plus an HTML alternative
#[derive(Debug, Default, Clone)]
pub struct HtmlRenderer {
    text: PlainTextRenderer,
    template: Option<String>,
}

impl HtmlRenderer {
    /// Renderer using the built-in page layout
    pub fn new() -> Self {
        Self::default()
    }

    /// Renderer filling a custom page template
    pub fn with_template(template: String) -> Result<Self> {
        if !template.contains(EPISODES_PLACEHOLDER) {
            bail!("digest template has no {} placeholder", EPISODES_PLACEHOLDER);
        }
        Ok(Self {
            text: PlainTextRenderer::new(),
            template: Some(template),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let template = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read digest template: {}", path.display()))?;
        Self::with_template(template)
            .with_context(|| format!("Invalid digest template: {}", path.display()))
    }

    /// The HTML document for `entries`
    pub fn render_html(&self, entries: &[DigestEntry], date: DateTime<Utc>) -> String {
        let stats = DigestStats::of(entries);
        let date = date.format("%B %-d, %Y").to_string();

        let mut cards = String::new();
        for entry in entries {
            episode_card(&mut cards, entry);
        }

        match &self.template {
            Some(template) => template
                .replace("{{date}}", &escape(&date))
                .replace("{{episode_count}}", &entries.len().to_string())
                .replace("{{word_count}}", &thousands(stats.words))
                .replace("{{duration_minutes}}", &format!("{:.1}", stats.minutes))
                .replace(EPISODES_PLACEHOLDER, &cards),
            None => builtin_page(&date, entries.len(), &stats, &cards),
        }
    }
}

impl DigestRenderer for HtmlRenderer {
    fn render(&self, entries: &[DigestEntry], date: DateTime<Utc>) -> DigestPayload {
        let mut payload = self.text.render(entries, date);
        if !payload.is_empty() {
            payload.html = Some(self.render_html(entries, date));
        }
        payload
    }
}

struct DigestStats {
    words: u64,
    minutes: f64,
}

impl DigestStats {
    fn of(entries: &[DigestEntry]) -> Self {
        Self {
            words: entries
                .iter()
                .filter_map(|e| e.item.transcript_word_count)
                .sum(),
            minutes: entries
                .iter()
                .filter_map(|e| e.item.transcript_duration)
                .sum::<f64>()
                / 60.0,
        }
    }
}

fn builtin_page(date: &str, count: usize, stats: &DigestStats, cards: &str) -> String {
    let date = escape(date);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Podcast Digest - {date}</title>
<style>
body {{ font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 800px; margin: 0 auto; padding: 20px; }}
.header {{ background: #4f46e5; color: white; padding: 30px; border-radius: 10px; text-align: center; margin-bottom: 30px; }}
.stats {{ background-color: #f8f9fa; padding: 20px; border-radius: 8px; margin-bottom: 30px; }}
.episode-card {{ border: 1px solid #e5e7eb; border-radius: 8px; padding: 20px; margin-bottom: 24px; }}
.episode-meta {{ color: #666; font-size: 14px; }}
.sentiment-badge {{ background: #eef2ff; color: #4338ca; padding: 4px 10px; border-radius: 12px; font-size: 12px; }}
.footer {{ text-align: center; color: #666; font-size: 14px; margin-top: 40px; padding-top: 20px; border-top: 1px solid #eee; }}
</style>
</head>
<body>
<div class="header">
<h1>Podcast Digest</h1>
<p>{date}</p>
</div>
<div class="stats">
<p><strong>{count} episodes</strong> processed | <strong>{words} words</strong> transcribed | <strong>{minutes:.1} minutes</strong> of content</p>
</div>
{cards}<div class="footer">
<p>Generated by podcast-agent</p>
<p>Summaries are machine-generated. Check important details against the episode.</p>
</div>
</body>
</html>
"#,
        date = date,
        count = count,
        words = thousands(stats.words),
        minutes = stats.minutes,
        cards = cards,
    )
}

fn episode_card(out: &mut String, entry: &DigestEntry) {
    let item = &entry.item;

    let _ = writeln!(out, r#"<div class="episode-card">"#);
    match &item.episode_url {
        Some(url) => {
            let _ = writeln!(
                out,
                r#"<h3><a href="{}">{}</a></h3>"#,
                escape(url),
                escape(&item.title)
            );
        }
        None => {
            let _ = writeln!(out, "<h3>{}</h3>", escape(&item.title));
        }
    }

    let mut meta = format!("<strong>Podcast:</strong> {}", escape(&item.podcast));
    if let Some(duration) = item.transcript_duration {
        let _ = write!(meta, " | <strong>Duration:</strong> {:.1} min", duration / 60.0);
    }
    let _ = write!(
        meta,
        " | <strong>Published:</strong> {}",
        item.published_at.format("%B %-d, %Y")
    );
    let _ = writeln!(out, r#"<p class="episode-meta">{}</p>"#, meta);

    match &entry.summary {
        Some(summary) => {
            let _ = writeln!(out, "<h4>Executive Summary</h4>");
            let _ = writeln!(out, "<p>{}</p>", escape(summary.executive_summary.trim()));

            if !summary.key_points.is_empty() {
                let _ = writeln!(out, "<h4>Key Points</h4>\n<ul>");
                for point in &summary.key_points {
                    let _ = writeln!(out, "<li>{}</li>", escape(point));
                }
                let _ = writeln!(out, "</ul>");
            }

            if !summary.topics.is_empty() {
                let _ = writeln!(out, "<h4>Topics</h4>");
                let _ = writeln!(out, "<p>{}</p>", escape(&summary.topics.join(", ")));
            }

            let _ = writeln!(
                out,
                r#"<p style="text-align: right;"><span class="sentiment-badge">{}</span></p>"#,
                summary.sentiment.as_str().to_uppercase()
            );
        }
        None => {
            let _ = writeln!(out, "<p><em>Summary unavailable.</em></p>");
        }
    }

    let _ = writeln!(out, "</div>");
}

/// Escape text for HTML element and attribute content
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// `4814` -> `4,814`
fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
