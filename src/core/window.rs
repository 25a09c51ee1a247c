//! Digest window selection.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use super::database::{format_ts, Database, StoreError};
use super::registry::{item_from_row, ITEM_COLUMNS};
use crate::domain::Item;

/// Selects summarized items for a trailing time window
#[derive(Debug, Clone)]
pub struct DigestWindowSelector {
    db: Database,
}

impl DigestWindowSelector {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Bounds of the window ending at `now`
    pub fn bounds(window_hours: u32, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - Duration::hours(i64::from(window_hours)), now)
    }

    /// Items whose summarization completed in `[now - window_hours, now]`,
    /// most recent first. Both ends are inclusive.
    pub fn select_for_window(
        &self,
        window_hours: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Item>, StoreError> {
        let (start, end) = Self::bounds(window_hours, now);
        let sql = format!(
            "SELECT {} FROM episodes
             WHERE summarization_completed_at IS NOT NULL
               AND summarization_completed_at >= ?1
               AND summarization_completed_at <= ?2
             ORDER BY summarization_completed_at DESC, id DESC",
            ITEM_COLUMNS
        );

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(params![format_ts(start), format_ts(end)], item_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }
}
