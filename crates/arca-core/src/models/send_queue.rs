//! The send queue: batches of outgoing transfers aggregated into one
//! transport submission. Queue items weakly reference their transfers (the
//! transfers keep independent state) and carry the opaque transport handle
//! once consumed.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{from_sql_time, to_sql_time};
use crate::error::{CoreError, Result};

/// Give up on a queue item after this many failed submissions.
pub const MAX_SUBMIT_RETRIES: i64 = 3;

#[derive(Debug, Clone)]
pub struct SendQueueItem {
    pub id: i64,
    pub priority: i64,
    pub created_time: DateTime<Utc>,
    pub retries: i64,
    pub destination: String,
    pub destination_endpoint: String,
    pub async_manager_name: String,
    pub transfer_handle: Option<String>,
    pub consumed: bool,
    pub consumed_time: Option<DateTime<Utc>>,
    pub completed: bool,
    pub completed_time: Option<DateTime<Utc>>,
    pub failed: bool,
}

impl SendQueueItem {
    const COLUMNS: &'static str = "id, priority, created_time, retries, destination,
         destination_endpoint, async_manager_name, transfer_handle,
         consumed, consumed_time, completed, completed_time, failed";

    pub fn new_item(
        conn: &Connection,
        priority: i64,
        destination: &str,
        destination_endpoint: &str,
        async_manager_name: &str,
    ) -> Result<SendQueueItem> {
        let created_time = Utc::now();
        conn.execute(
            "INSERT INTO send_queue
                 (priority, created_time, destination, destination_endpoint, async_manager_name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                priority,
                to_sql_time(created_time),
                destination,
                destination_endpoint,
                async_manager_name,
            ],
        )?;
        Ok(SendQueueItem {
            id: conn.last_insert_rowid(),
            priority,
            created_time,
            retries: 0,
            destination: destination.to_string(),
            destination_endpoint: destination_endpoint.to_string(),
            async_manager_name: async_manager_name.to_string(),
            transfer_handle: None,
            consumed: false,
            consumed_time: None,
            completed: false,
            completed_time: None,
            failed: false,
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<SendQueueItem> {
        let created: String = row.get("created_time")?;
        let consumed_time: Option<String> = row.get("consumed_time")?;
        let completed_time: Option<String> = row.get("completed_time")?;
        Ok(SendQueueItem {
            id: row.get("id")?,
            priority: row.get("priority")?,
            created_time: from_sql_time(&created).unwrap_or_else(|_| Utc::now()),
            retries: row.get("retries")?,
            destination: row.get("destination")?,
            destination_endpoint: row.get("destination_endpoint")?,
            async_manager_name: row.get("async_manager_name")?,
            transfer_handle: row.get("transfer_handle")?,
            consumed: row.get::<_, i64>("consumed")? != 0,
            consumed_time: consumed_time.as_deref().and_then(|s| from_sql_time(s).ok()),
            completed: row.get::<_, i64>("completed")? != 0,
            completed_time: completed_time.as_deref().and_then(|s| from_sql_time(s).ok()),
            failed: row.get::<_, i64>("failed")? != 0,
        })
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Option<SendQueueItem>> {
        conn.query_row(
            &format!("SELECT {} FROM send_queue WHERE id = ?1", Self::COLUMNS),
            params![id],
            SendQueueItem::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    /// Oldest highest-priority item not yet handed to the transport.
    pub fn next_queued(conn: &Connection) -> Result<Option<SendQueueItem>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM send_queue
                 WHERE consumed = 0 AND completed = 0
                 ORDER BY priority DESC, created_time ASC LIMIT 1",
                Self::COLUMNS
            ),
            [],
            SendQueueItem::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    /// Items submitted to the transport and awaiting a verdict.
    pub fn consumed_incomplete(conn: &Connection) -> Result<Vec<SendQueueItem>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM send_queue WHERE consumed = 1 AND completed = 0 ORDER BY id",
            Self::COLUMNS
        ))?;
        let rows = stmt.query_map([], SendQueueItem::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Count of live transport handles; the global cap is enforced
    /// against this.
    pub fn live_handle_count(conn: &Connection) -> Result<usize> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM send_queue WHERE consumed = 1 AND completed = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn mark_consumed(&mut self, conn: &Connection, handle: &str) -> Result<()> {
        let now = Utc::now();
        conn.execute(
            "UPDATE send_queue SET consumed = 1, consumed_time = ?1, transfer_handle = ?2
             WHERE id = ?3",
            params![to_sql_time(now), handle, self.id],
        )?;
        self.consumed = true;
        self.consumed_time = Some(now);
        self.transfer_handle = Some(handle.to_string());
        Ok(())
    }

    pub fn record_retry(&mut self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE send_queue SET retries = retries + 1 WHERE id = ?1",
            params![self.id],
        )?;
        self.retries += 1;
        Ok(())
    }

    pub fn mark_completed(&mut self, conn: &Connection, failed: bool) -> Result<()> {
        let now = Utc::now();
        conn.execute(
            "UPDATE send_queue SET completed = 1, completed_time = ?1, failed = ?2 WHERE id = ?3",
            params![to_sql_time(now), failed as i64, self.id],
        )?;
        self.completed = true;
        self.completed_time = Some(now);
        self.failed = failed;
        Ok(())
    }

    /// Consumed items whose transport handle has outlived `max_age_in_days`.
    pub fn overdue(conn: &Connection, max_age_in_days: i64) -> Result<Vec<SendQueueItem>> {
        let cutoff = to_sql_time(Utc::now() - Duration::days(max_age_in_days));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM send_queue
             WHERE consumed = 1 AND completed = 0 AND consumed_time < ?1
             ORDER BY id",
            Self::COLUMNS
        ))?;
        let rows = stmt.query_map(params![cutoff], SendQueueItem::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn queue_ordering_prefers_priority_then_age() {
        let db = Database::open_in_memory().unwrap();
        let low = SendQueueItem::new_item(db.conn(), 0, "b", "host", "local_async").unwrap();
        let high = SendQueueItem::new_item(db.conn(), 5, "b", "host", "local_async").unwrap();

        let next = SendQueueItem::next_queued(db.conn()).unwrap().unwrap();
        assert_eq!(next.id, high.id);

        let mut high = high;
        high.mark_consumed(db.conn(), "local_async:ok:1").unwrap();
        let next = SendQueueItem::next_queued(db.conn()).unwrap().unwrap();
        assert_eq!(next.id, low.id);
    }

    #[test]
    fn live_handle_accounting() {
        let db = Database::open_in_memory().unwrap();
        let mut a = SendQueueItem::new_item(db.conn(), 0, "b", "host", "local_async").unwrap();
        let mut b = SendQueueItem::new_item(db.conn(), 0, "b", "host", "local_async").unwrap();
        assert_eq!(SendQueueItem::live_handle_count(db.conn()).unwrap(), 0);

        a.mark_consumed(db.conn(), "local_async:ok:a").unwrap();
        b.mark_consumed(db.conn(), "local_async:ok:b").unwrap();
        assert_eq!(SendQueueItem::live_handle_count(db.conn()).unwrap(), 2);

        a.mark_completed(db.conn(), false).unwrap();
        assert_eq!(SendQueueItem::live_handle_count(db.conn()).unwrap(), 1);
        assert_eq!(SendQueueItem::consumed_incomplete(db.conn()).unwrap().len(), 1);
    }
}
