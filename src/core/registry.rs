//! Item registry: every tracked episode and its per-stage markers.
//!
//! The registry answers two questions for the scheduler:
//! - which items may run a given stage right now (`eligible_for`)
//! - what happened when they did (`record_outcome`, the only stage mutation)
//!
//! Eligibility is derived purely from artifact columns. The job ledger is
//! never consulted, so a crash between executor and commit just leaves the
//! item eligible for the next run.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, warn};

use super::database::{format_ts, opt_ts_column, ts_column, Database, StoreError};
use crate::domain::{
    Highlight, Item, NewItem, Sentiment, StageFailure, StageKind, StageOutput, SummaryRecord,
};

pub(crate) const ITEM_COLUMNS: &str = "id, guid, podcast, title, description, audio_url, \
     episode_url, published_at, created_at, downloaded, audio_file_path, file_size, \
     download_started_at, download_completed_at, transcribed, transcript_file_path, \
     transcript_word_count, transcript_duration, transcript_language, \
     transcript_language_probability, transcription_started_at, transcription_completed_at, \
     summarized, summary_file_path, summarization_started_at, summarization_completed_at, \
     last_error, retry_count";

/// Map a row selected with [`ITEM_COLUMNS`]
pub(crate) fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        guid: row.get(1)?,
        podcast: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        audio_url: row.get(5)?,
        episode_url: row.get(6)?,
        published_at: ts_column(row, 7)?,
        created_at: ts_column(row, 8)?,
        downloaded: row.get::<_, i32>(9)? == 1,
        audio_file_path: row.get(10)?,
        file_size: row.get::<_, Option<i64>>(11)?.map(|v| v.max(0) as u64),
        download_started_at: opt_ts_column(row, 12)?,
        download_completed_at: opt_ts_column(row, 13)?,
        transcribed: row.get::<_, i32>(14)? == 1,
        transcript_file_path: row.get(15)?,
        transcript_word_count: row.get::<_, Option<i64>>(16)?.map(|v| v.max(0) as u64),
        transcript_duration: row.get(17)?,
        transcript_language: row.get(18)?,
        transcript_language_probability: row.get(19)?,
        transcription_started_at: opt_ts_column(row, 20)?,
        transcription_completed_at: opt_ts_column(row, 21)?,
        summarized: row.get::<_, i32>(22)? == 1,
        summary_file_path: row.get(23)?,
        summarization_started_at: opt_ts_column(row, 24)?,
        summarization_completed_at: opt_ts_column(row, 25)?,
        last_error: row.get(26)?,
        retry_count: row.get::<_, i64>(27)?.max(0) as u32,
    })
}

/// Counts shown by `status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: u64,
    pub downloaded: u64,
    pub transcribed: u64,
    pub summarized: u64,
    pub pending_download: u64,
    pub pending_transcription: u64,
    pub pending_summarization: u64,
    /// Items whose most recent attempt failed
    pub errored: u64,
}

/// Durable record of all items
#[derive(Debug, Clone)]
pub struct ItemRegistry {
    db: Database,
}

impl ItemRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert acquisition output, ignoring guids that are already known.
    ///
    /// Returns the number of rows actually inserted.
    pub fn insert_new(&self, items: &[NewItem]) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }

        let now = format_ts(Utc::now());
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO episodes
                        (guid, podcast, title, description, audio_url, episode_url,
                         published_at, created_at, file_size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for item in items {
                    inserted += stmt.execute(params![
                        item.guid,
                        item.podcast,
                        item.title,
                        item.description,
                        item.audio_url,
                        item.episode_url,
                        format_ts(item.published_at),
                        now,
                        item.file_size.map(|s| s as i64),
                    ])?;
                }
            }
            tx.commit()?;

            debug!(offered = items.len(), inserted, "Registered new items");
            Ok(inserted)
        })
    }

    /// Items whose predecessor artifact exists and whose own artifact does not.
    ///
    /// Ordered by the predecessor's completion time (publication time for
    /// downloads), oldest first, ties broken by id. `limit` caps the size.
    pub fn eligible_for(
        &self,
        stage: StageKind,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, StoreError> {
        let predicate = match stage {
            StageKind::Download => {
                "audio_file_path IS NULL AND downloaded = 0 ORDER BY published_at, id"
            }
            StageKind::Transcription => {
                "audio_file_path IS NOT NULL AND transcript_file_path IS NULL
                 ORDER BY download_completed_at, id"
            }
            StageKind::Summarization => {
                "transcript_file_path IS NOT NULL AND summary_file_path IS NULL
                 ORDER BY transcription_completed_at, id"
            }
        };
        let sql = format!(
            "SELECT {} FROM episodes WHERE {} LIMIT ?1",
            ITEM_COLUMNS, predicate
        );
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(params![limit], item_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }

    /// Record the outcome of one stage attempt in a single transaction.
    ///
    /// Success writes the artifact, flag, metadata and timestamps and clears
    /// `last_error`; failure writes `last_error` and bumps `retry_count`.
    /// Not guarded against repeated calls: callers go through `eligible_for`.
    pub fn record_outcome(
        &self,
        item_id: i64,
        stage: StageKind,
        started_at: DateTime<Utc>,
        outcome: &Result<StageOutput, StageFailure>,
    ) -> Result<(), StoreError> {
        self.record_outcome_at(item_id, stage, started_at, Utc::now(), outcome)
    }

    /// [`record_outcome`](Self::record_outcome) with an explicit completion time
    pub fn record_outcome_at(
        &self,
        item_id: i64,
        stage: StageKind,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        outcome: &Result<StageOutput, StageFailure>,
    ) -> Result<(), StoreError> {
        let output = match outcome {
            Ok(output) => output,
            Err(failure) => return self.record_failure(item_id, stage, failure),
        };

        if output.stage() != stage {
            return Err(StoreError::StageMismatch {
                expected: stage,
                actual: output.stage(),
            });
        }

        let started = format_ts(started_at);
        let completed = format_ts(completed_at);

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            let updated = match output {
                StageOutput::Downloaded {
                    audio_path,
                    file_size,
                } => tx.execute(
                    "UPDATE episodes SET
                        audio_file_path = ?1, downloaded = 1, file_size = ?2,
                        download_started_at = ?3, download_completed_at = ?4,
                        last_error = NULL
                     WHERE id = ?5",
                    params![audio_path, *file_size as i64, started, completed, item_id],
                )?,
                StageOutput::Transcribed {
                    transcript_path,
                    word_count,
                    duration_secs,
                    language,
                    language_probability,
                } => tx.execute(
                    "UPDATE episodes SET
                        transcript_file_path = ?1, transcribed = 1,
                        transcript_word_count = ?2, transcript_duration = ?3,
                        transcript_language = ?4, transcript_language_probability = ?5,
                        transcription_started_at = ?6, transcription_completed_at = ?7,
                        last_error = NULL
                     WHERE id = ?8 AND audio_file_path IS NOT NULL",
                    params![
                        transcript_path,
                        *word_count as i64,
                        duration_secs,
                        language,
                        language_probability,
                        started,
                        completed,
                        item_id
                    ],
                )?,
                StageOutput::Summarized {
                    summary_path,
                    summary,
                    model_used,
                } => {
                    let updated = tx.execute(
                        "UPDATE episodes SET
                            summary_file_path = ?1, summarized = 1,
                            summarization_started_at = ?2, summarization_completed_at = ?3,
                            last_error = NULL
                         WHERE id = ?4 AND transcript_file_path IS NOT NULL",
                        params![summary_path, started, completed, item_id],
                    )?;
                    if updated == 1 {
                        upsert_summary(&tx, item_id, summary, model_used, &completed)?;
                    }
                    updated
                }
            };

            if updated == 0 {
                return Err(missing_row_error(&tx, item_id, stage)?);
            }

            tx.commit()?;
            Ok(())
        })
    }

    fn record_failure(
        &self,
        item_id: i64,
        stage: StageKind,
        failure: &StageFailure,
    ) -> Result<(), StoreError> {
        let message = format!("{}: {}", stage, failure);
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE episodes SET last_error = ?1, retry_count = retry_count + 1
                 WHERE id = ?2",
                params![message, item_id],
            )?;
            if updated == 0 {
                warn!(item_id, %stage, "Failure reported for unknown item");
                return Err(StoreError::NotFound(item_id));
            }
            Ok(())
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<Item>, StoreError> {
        let sql = format!("SELECT {} FROM episodes WHERE id = ?1", ITEM_COLUMNS);
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(&sql, params![id], item_from_row)
                .optional()?)
        })
    }

    pub fn get_by_guid(&self, guid: &str) -> Result<Option<Item>, StoreError> {
        let sql = format!("SELECT {} FROM episodes WHERE guid = ?1", ITEM_COLUMNS);
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(&sql, params![guid], item_from_row)
                .optional()?)
        })
    }

    /// Structured summary stored alongside the summarization marker
    pub fn summary_for(&self, item_id: i64) -> Result<Option<SummaryRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let raw = conn
                .query_row(
                    "SELECT executive_summary, key_points, topics, highlights, sentiment
                     FROM summaries WHERE episode_id = ?1",
                    params![item_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?;

            let Some((executive_summary, key_points, topics, highlights, sentiment)) = raw else {
                return Ok(None);
            };

            Ok(Some(SummaryRecord {
                executive_summary,
                key_points: serde_json::from_str::<Vec<String>>(&key_points)?,
                topics: serde_json::from_str::<Vec<String>>(&topics)?,
                highlights: serde_json::from_str::<Vec<Highlight>>(&highlights)?,
                sentiment: Sentiment::parse_lenient(&sentiment),
            }))
        })
    }

    /// Most recently published items
    pub fn recent(&self, limit: usize) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "SELECT {} FROM episodes ORDER BY published_at DESC, id DESC LIMIT ?1",
            ITEM_COLUMNS
        );
        self.query_items(&sql, limit)
    }

    /// Items whose last attempt failed, most retried first
    pub fn errored(&self, limit: usize) -> Result<Vec<Item>, StoreError> {
        let sql = format!(
            "SELECT {} FROM episodes WHERE last_error IS NOT NULL
             ORDER BY retry_count DESC, id LIMIT ?1",
            ITEM_COLUMNS
        );
        self.query_items(&sql, limit)
    }

    pub fn stats(&self) -> Result<RegistryStats, StoreError> {
        self.db.with_conn(|conn| {
            let stats = conn.query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(audio_file_path IS NOT NULL), 0),
                    COALESCE(SUM(transcript_file_path IS NOT NULL), 0),
                    COALESCE(SUM(summary_file_path IS NOT NULL), 0),
                    COALESCE(SUM(audio_file_path IS NULL AND downloaded = 0), 0),
                    COALESCE(SUM(audio_file_path IS NOT NULL AND transcript_file_path IS NULL), 0),
                    COALESCE(SUM(transcript_file_path IS NOT NULL AND summary_file_path IS NULL), 0),
                    COALESCE(SUM(last_error IS NOT NULL), 0)
                 FROM episodes",
                [],
                |row| {
                    Ok(RegistryStats {
                        total: row.get::<_, i64>(0)? as u64,
                        downloaded: row.get::<_, i64>(1)? as u64,
                        transcribed: row.get::<_, i64>(2)? as u64,
                        summarized: row.get::<_, i64>(3)? as u64,
                        pending_download: row.get::<_, i64>(4)? as u64,
                        pending_transcription: row.get::<_, i64>(5)? as u64,
                        pending_summarization: row.get::<_, i64>(6)? as u64,
                        errored: row.get::<_, i64>(7)? as u64,
                    })
                },
            )?;
            Ok(stats)
        })
    }

    fn query_items(&self, sql: &str, limit: usize) -> Result<Vec<Item>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let items = stmt
                .query_map(params![limit as i64], item_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }
}

fn upsert_summary(
    conn: &Connection,
    item_id: i64,
    summary: &SummaryRecord,
    model_used: &str,
    created_at: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO summaries
            (episode_id, executive_summary, key_points, topics, highlights, sentiment,
             summary_length, model_used, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(episode_id) DO UPDATE SET
            executive_summary = excluded.executive_summary,
            key_points = excluded.key_points,
            topics = excluded.topics,
            highlights = excluded.highlights,
            sentiment = excluded.sentiment,
            summary_length = excluded.summary_length,
            model_used = excluded.model_used,
            created_at = excluded.created_at",
        params![
            item_id,
            summary.executive_summary,
            serde_json::to_string(&summary.key_points)?,
            serde_json::to_string(&summary.topics)?,
            serde_json::to_string(&summary.highlights)?,
            summary.sentiment.as_str(),
            summary.word_count() as i64,
            model_used,
            created_at,
        ],
    )?;
    Ok(())
}

/// Explain why a success update touched no rows
fn missing_row_error(
    conn: &Connection,
    item_id: i64,
    stage: StageKind,
) -> Result<StoreError, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM episodes WHERE id = ?1",
            params![item_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    Ok(match (exists, stage.predecessor()) {
        (true, Some(missing)) => StoreError::MissingPrerequisite {
            item_id,
            stage,
            missing,
        },
        _ => StoreError::NotFound(item_id),
    })
}
