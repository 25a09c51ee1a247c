//! Job ledger: an audit trail of stage attempts.
//!
//! One row per attempt. A row opens as `pending` when the item is queued,
//! moves to `processing` once a worker slot is free and is finalized
//! exactly once. Re-runs produce new rows for the same item and stage, which
//! is expected. Nothing here feeds back into eligibility.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::database::{
    format_ts, opt_ts_column, parsed_column, stored_precision, ts_column, Database, StoreError,
};
use crate::domain::{
    FailureKind, Item, Job, JobHandle, JobOutcome, JobStatus, StageKind,
};

const JOB_COLUMNS: &str = "id, job_type, episode_id, status, started_at, completed_at, result, \
     error_kind, error_message, retry_count, max_retries, created_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let error_kind: Option<String> = row.get(7)?;
    Ok(Job {
        id: row.get(0)?,
        stage: parsed_column(row, 1)?,
        item_id: row.get(2)?,
        status: parsed_column(row, 3)?,
        started_at: opt_ts_column(row, 4)?,
        completed_at: opt_ts_column(row, 5)?,
        result: row.get(6)?,
        error_kind: error_kind.and_then(|k| k.parse::<FailureKind>().ok()),
        error_message: row.get(8)?,
        retry_count: row.get::<_, i64>(9)?.max(0) as u32,
        max_retries: row.get::<_, i64>(10)?.max(0) as u32,
        created_at: ts_column(row, 11)?,
    })
}

/// Append-mostly store of stage attempts
#[derive(Debug, Clone)]
pub struct JobLedger {
    db: Database,
    max_retries: u32,
}

impl JobLedger {
    /// `max_retries` is stored on every row for operators; nothing enforces it
    pub fn new(db: Database, max_retries: u32) -> Self {
        Self { db, max_retries }
    }

    /// Open a `pending` row for a queued attempt. Purely additive.
    pub fn begin_attempt(&self, stage: StageKind, item: &Item) -> Result<JobHandle, StoreError> {
        let queued_at = Utc::now();
        let ts = format_ts(queued_at);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO processing_jobs
                    (job_type, episode_id, status, retry_count, max_retries, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    stage.as_str(),
                    item.id,
                    JobStatus::Pending.as_str(),
                    item.retry_count as i64,
                    self.max_retries as i64,
                    ts,
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!(job_id = id, item_id = item.id, %stage, "Job queued");

            Ok(JobHandle {
                id,
                stage,
                item_id: item.id,
                queued_at,
            })
        })
    }

    /// Move a `pending` row to `processing` and stamp its start time
    pub fn start_attempt(&self, handle: &JobHandle) -> Result<DateTime<Utc>, StoreError> {
        let started_at = stored_precision(Utc::now());

        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE processing_jobs SET status = ?1, started_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![
                    JobStatus::Processing.as_str(),
                    format_ts(started_at),
                    handle.id,
                    JobStatus::Pending.as_str(),
                ],
            )?;

            if updated == 0 {
                return Err(not_updated_error(conn, handle.id)?);
            }

            debug!(job_id = handle.id, "Job started");
            Ok(started_at)
        })
    }

    /// Finalize the row opened by `begin_attempt`.
    ///
    /// A row already in a final state is left untouched and
    /// [`StoreError::AlreadyFinalized`] is returned.
    pub fn complete_attempt(
        &self,
        handle: &JobHandle,
        outcome: &JobOutcome,
    ) -> Result<(), StoreError> {
        let completed_at = format_ts(Utc::now());
        let (result, error_kind, error_message) = match outcome {
            JobOutcome::Completed { result } => (Some(result.as_str()), None, None),
            JobOutcome::Failed { kind, message } => {
                (None, Some(kind.as_str()), Some(message.as_str()))
            }
        };

        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE processing_jobs SET
                    status = ?1, completed_at = ?2, result = ?3,
                    error_kind = ?4, error_message = ?5
                 WHERE id = ?6 AND status NOT IN ('completed', 'failed')",
                params![
                    outcome.status().as_str(),
                    completed_at,
                    result,
                    error_kind,
                    error_message,
                    handle.id,
                ],
            )?;

            if updated == 0 {
                return Err(not_updated_error(conn, handle.id)?);
            }

            debug!(job_id = handle.id, status = %outcome.status(), "Job finalized");
            Ok(())
        })
    }

    pub fn get(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {} FROM processing_jobs WHERE id = ?1", JOB_COLUMNS);
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(&sql, params![job_id], job_from_row)
                .optional()?)
        })
    }

    /// All attempts for an item, oldest first
    pub fn jobs_for_item(&self, item_id: i64) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {} FROM processing_jobs WHERE episode_id = ?1 ORDER BY id",
            JOB_COLUMNS
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let jobs = stmt
                .query_map(params![item_id], job_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })
    }

    /// Latest attempts across all items, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {} FROM processing_jobs ORDER BY id DESC LIMIT ?1",
            JOB_COLUMNS
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let jobs = stmt
                .query_map(params![limit as i64], job_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })
    }

    pub fn count_by_status(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM processing_jobs GROUP BY status")?;
            let counts = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
            Ok(counts)
        })
    }
}

/// Why an update guarded on status touched no row
fn not_updated_error(conn: &Connection, job_id: i64) -> Result<StoreError, StoreError> {
    let status = conn
        .query_row(
            "SELECT status FROM processing_jobs WHERE id = ?1",
            params![job_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    Ok(match status.map(|s| s.parse::<JobStatus>()) {
        None => StoreError::JobNotFound(job_id),
        Some(Ok(status)) if !status.is_final() => StoreError::JobNotPending(job_id),
        Some(_) => StoreError::AlreadyFinalized(job_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::ItemRegistry;
    use crate::domain::NewItem;

    fn setup() -> (ItemRegistry, JobLedger, Item) {
        let db = Database::open_in_memory().unwrap();
        let registry = ItemRegistry::new(db.clone());
        registry
            .insert_new(&[NewItem {
                guid: "g-1".to_string(),
                podcast: "Cast".to_string(),
                title: "One".to_string(),
                description: None,
                audio_url: "https://example.com/1.mp3".to_string(),
                episode_url: None,
                published_at: Utc::now(),
                file_size: None,
            }])
            .unwrap();
        let item = registry.get_by_guid("g-1").unwrap().unwrap();
        (registry, JobLedger::new(db, 3), item)
    }

    #[test]
    fn test_begin_opens_pending_row() {
        let (_registry, ledger, item) = setup();
        let handle = ledger.begin_attempt(StageKind::Download, &item).unwrap();

        let job = ledger.get(handle.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.stage, StageKind::Download);
        assert_eq!(job.max_retries, 3);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_start_moves_pending_to_processing_once() {
        let (_registry, ledger, item) = setup();
        let handle = ledger.begin_attempt(StageKind::Transcription, &item).unwrap();

        let started_at = ledger.start_attempt(&handle).unwrap();
        let job = ledger.get(handle.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.started_at, Some(started_at));

        let err = ledger.start_attempt(&handle).unwrap_err();
        assert!(matches!(err, StoreError::JobNotPending(id) if id == handle.id));
    }

    #[test]
    fn test_start_after_finalize_is_rejected() {
        let (_registry, ledger, item) = setup();
        let handle = ledger.begin_attempt(StageKind::Download, &item).unwrap();
        ledger
            .complete_attempt(
                &handle,
                &JobOutcome::Completed {
                    result: "ok".to_string(),
                },
            )
            .unwrap();

        let err = ledger.start_attempt(&handle).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyFinalized(_)));
    }

    #[test]
    fn test_complete_finalizes_once() {
        let (_registry, ledger, item) = setup();
        let handle = ledger.begin_attempt(StageKind::Download, &item).unwrap();

        let outcome = JobOutcome::Failed {
            kind: FailureKind::Transient,
            message: "timeout".to_string(),
        };
        ledger.complete_attempt(&handle, &outcome).unwrap();

        let again = JobOutcome::Completed {
            result: "late".to_string(),
        };
        let err = ledger.complete_attempt(&handle, &again).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyFinalized(id) if id == handle.id));

        let job = ledger.get(handle.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind, Some(FailureKind::Transient));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_repeat_attempts_are_separate_rows() {
        let (_registry, ledger, item) = setup();
        for _ in 0..3 {
            let handle = ledger.begin_attempt(StageKind::Download, &item).unwrap();
            ledger
                .complete_attempt(
                    &handle,
                    &JobOutcome::Completed {
                        result: "ok".to_string(),
                    },
                )
                .unwrap();
        }

        assert_eq!(ledger.jobs_for_item(item.id).unwrap().len(), 3);
        assert_eq!(ledger.count_by_status().unwrap().get("completed"), Some(&3));
    }
}
