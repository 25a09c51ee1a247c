//! Fixtures shared by unit tests.

use chrono::{TimeZone, Utc};

use crate::domain::Item;

/// A freshly acquired item, adjusted by `f`
pub(crate) fn item_with(f: impl FnOnce(&mut Item)) -> Item {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let mut item = Item {
        id: 1,
        guid: "guid-1".to_string(),
        podcast: "Test Cast".to_string(),
        title: "Episode 1".to_string(),
        description: None,
        audio_url: "https://example.com/a.mp3".to_string(),
        episode_url: None,
        published_at: at,
        created_at: at,
        downloaded: false,
        audio_file_path: None,
        file_size: None,
        download_started_at: None,
        download_completed_at: None,
        transcribed: false,
        transcript_file_path: None,
        transcript_word_count: None,
        transcript_duration: None,
        transcript_language: None,
        transcript_language_probability: None,
        transcription_started_at: None,
        transcription_completed_at: None,
        summarized: false,
        summary_file_path: None,
        summarization_started_at: None,
        summarization_completed_at: None,
        last_error: None,
        retry_count: 0,
    };
    f(&mut item);
    item
}
