//! Record of digest deliveries. Batches are written once and never updated.

use chrono::Utc;
use rusqlite::params;

use super::database::{format_ts, opt_ts_column, parsed_column, ts_column, Database, StoreError};
use crate::domain::{ChannelDelivery, DigestBatch};

#[derive(Debug, Clone)]
pub struct DigestLog {
    db: Database,
}

impl DigestLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a batch and its per-channel deliveries; returns the batch id
    pub fn record(&self, batch: &DigestBatch) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO digest_batches
                    (digest_date, window_start, window_end, item_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    format_ts(batch.digest_date),
                    format_ts(batch.window_start),
                    format_ts(batch.window_end),
                    batch.item_count as i64,
                    format_ts(Utc::now()),
                ],
            )?;
            let batch_id = tx.last_insert_rowid();

            for delivery in &batch.deliveries {
                tx.execute(
                    "INSERT INTO digest_deliveries
                        (batch_id, channel, sent, sent_at, delivered, failed, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        batch_id,
                        delivery.channel.as_str(),
                        delivery.sent as i32,
                        delivery.sent_at.map(format_ts),
                        delivery.delivered as i64,
                        delivery.failed as i64,
                        delivery.error,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(batch_id)
        })
    }

    /// Latest batches, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<DigestBatch>, StoreError> {
        self.db.with_conn(|conn| {
            let mut batches = {
                let mut stmt = conn.prepare(
                    "SELECT id, digest_date, window_start, window_end, item_count
                     FROM digest_batches ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], |row| {
                    Ok(DigestBatch {
                        id: Some(row.get(0)?),
                        digest_date: ts_column(row, 1)?,
                        window_start: ts_column(row, 2)?,
                        window_end: ts_column(row, 3)?,
                        item_count: row.get::<_, i64>(4)?.max(0) as usize,
                        deliveries: Vec::new(),
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut stmt = conn.prepare(
                "SELECT channel, sent, sent_at, delivered, failed, error
                 FROM digest_deliveries WHERE batch_id = ?1 ORDER BY id",
            )?;
            for batch in &mut batches {
                let batch_id = batch.id.unwrap_or_default();
                batch.deliveries = stmt
                    .query_map(params![batch_id], |row| {
                        Ok(ChannelDelivery {
                            channel: parsed_column(row, 0)?,
                            sent: row.get::<_, i32>(1)? == 1,
                            sent_at: opt_ts_column(row, 2)?,
                            delivered: row.get::<_, i64>(3)?.max(0) as usize,
                            failed: row.get::<_, i64>(4)?.max(0) as usize,
                            error: row.get(5)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
            }

            Ok(batches)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::database::stored_precision;
    use crate::domain::ChannelKind;
    use chrono::Duration;

    #[test]
    fn test_record_and_read_back() {
        let log = DigestLog::new(Database::open_in_memory().unwrap());
        let now = stored_precision(Utc::now());

        let batch = DigestBatch {
            id: None,
            digest_date: now,
            window_start: now - Duration::hours(25),
            window_end: now,
            item_count: 2,
            deliveries: vec![
                ChannelDelivery {
                    channel: ChannelKind::Telegram,
                    sent: true,
                    sent_at: Some(now),
                    delivered: 2,
                    failed: 0,
                    error: None,
                },
                ChannelDelivery {
                    channel: ChannelKind::Webhook,
                    sent: false,
                    sent_at: None,
                    delivered: 0,
                    failed: 1,
                    error: Some("a@example.com: HTTP 500".to_string()),
                },
            ],
        };

        let id = log.record(&batch).unwrap();
        let recent = log.recent(5).unwrap();

        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, Some(id));
        assert_eq!(recent[0].window_start, batch.window_start);
        assert_eq!(recent[0].deliveries, batch.deliveries);
        assert!(recent[0].any_sent());
    }
}
