//! SQLite handle shared by the registry, the ledger and the digest log.
//!
//! There is no process-wide session: callers open a [`Database`] and hand a
//! clone of it to every component. Clones share one connection behind a
//! mutex, which is only ever held for a single statement or transaction and
//! never across an `.await`.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings with
//! microsecond precision, so string comparison in SQL is chronological.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use thiserror::Error;
use tracing::debug;

use crate::domain::StageKind;

/// Errors raised by the persistent stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("item {0} not found")]
    NotFound(i64),

    /// A success was reported for a stage whose predecessor artifact is absent
    #[error("item {item_id} has no {missing} artifact, refusing to record {stage}")]
    MissingPrerequisite {
        item_id: i64,
        stage: StageKind,
        missing: StageKind,
    },

    #[error("output for {actual} cannot complete the {expected} stage")]
    StageMismatch {
        expected: StageKind,
        actual: StageKind,
    },

    #[error("job {0} is already finalized")]
    AlreadyFinalized(i64),

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job {0} is not pending")]
    JobNotPending(i64),

    #[error("database task failed: {0}")]
    TaskFailed(String),
}

/// Cloneable handle to the SQLite database
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open (or create) the database file and apply the schema
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;

        // WAL lets status queries read while a stage run is writing
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=5000;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(db_path.to_path_buf()),
        };
        db.init_schema()?;

        debug!(path = %db_path.display(), "Database opened");
        Ok(db)
    }

    /// Private in-memory database, mostly for tests and dry runs
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Location on disk, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with exclusive access to the connection
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut conn)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS episodes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    guid TEXT NOT NULL UNIQUE,
                    podcast TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT,
                    audio_url TEXT NOT NULL,
                    episode_url TEXT,
                    published_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,

                    downloaded INTEGER NOT NULL DEFAULT 0,
                    audio_file_path TEXT,
                    file_size INTEGER,
                    download_started_at TEXT,
                    download_completed_at TEXT,

                    transcribed INTEGER NOT NULL DEFAULT 0,
                    transcript_file_path TEXT,
                    transcript_word_count INTEGER,
                    transcript_duration REAL,
                    transcript_language TEXT,
                    transcript_language_probability REAL,
                    transcription_started_at TEXT,
                    transcription_completed_at TEXT,

                    summarized INTEGER NOT NULL DEFAULT 0,
                    summary_file_path TEXT,
                    summarization_started_at TEXT,
                    summarization_completed_at TEXT,

                    last_error TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_episodes_published
                    ON episodes(published_at);
                CREATE INDEX IF NOT EXISTS idx_episodes_download_done
                    ON episodes(download_completed_at);
                CREATE INDEX IF NOT EXISTS idx_episodes_transcription_done
                    ON episodes(transcription_completed_at);
                CREATE INDEX IF NOT EXISTS idx_episodes_summarization_done
                    ON episodes(summarization_completed_at);

                CREATE TABLE IF NOT EXISTS summaries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    episode_id INTEGER NOT NULL UNIQUE,
                    executive_summary TEXT NOT NULL,
                    key_points TEXT NOT NULL,
                    topics TEXT NOT NULL,
                    highlights TEXT NOT NULL,
                    sentiment TEXT NOT NULL,
                    summary_length INTEGER NOT NULL,
                    model_used TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (episode_id) REFERENCES episodes(id)
                );

                CREATE TABLE IF NOT EXISTS processing_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_type TEXT NOT NULL,
                    episode_id INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    started_at TEXT,
                    completed_at TEXT,
                    result TEXT,
                    error_kind TEXT,
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (episode_id) REFERENCES episodes(id)
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_episode ON processing_jobs(episode_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON processing_jobs(status);

                CREATE TABLE IF NOT EXISTS digest_batches (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    digest_date TEXT NOT NULL,
                    window_start TEXT NOT NULL,
                    window_end TEXT NOT NULL,
                    item_count INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS digest_deliveries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    batch_id INTEGER NOT NULL,
                    channel TEXT NOT NULL,
                    sent INTEGER NOT NULL DEFAULT 0,
                    sent_at TEXT,
                    delivered INTEGER NOT NULL DEFAULT 0,
                    failed INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    FOREIGN KEY (batch_id) REFERENCES digest_batches(id),
                    UNIQUE(batch_id, channel)
                );
                "#,
            )?;
            Ok(())
        })
    }
}

/// Encode a timestamp in the stored fixed-width form
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

/// Truncate to the stored precision, so values compare equal after a round trip
pub fn stored_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    parse_ts(&format_ts(ts)).unwrap_or(ts)
}

/// Read a non-null timestamp column
pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a nullable timestamp column
pub(crate) fn opt_ts_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        parse_ts(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Read a text column through `FromStr`
pub(crate) fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}
