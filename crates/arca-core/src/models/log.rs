//! Observability rows: the append-only error log and the background task
//! log, plus the advisory claim used for task-level mutual exclusion
//! between worker processes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use arca_protocol::errors::{ErrorCategory, ErrorSeverity};

use crate::db::{from_sql_time, to_sql_time};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ErrorLogRow {
    pub id: i64,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub message: String,
    pub raised_time: DateTime<Utc>,
    pub cleared: bool,
}

/// Persist an error row and mirror it to the process log.
pub fn log_error(
    conn: &Connection,
    severity: ErrorSeverity,
    category: ErrorCategory,
    message: &str,
) -> Result<i64> {
    match severity {
        ErrorSeverity::Critical | ErrorSeverity::Error => {
            tracing::error!(category = category.as_str(), "{message}")
        }
        ErrorSeverity::Warning => tracing::warn!(category = category.as_str(), "{message}"),
        ErrorSeverity::Info => tracing::info!(category = category.as_str(), "{message}"),
    }
    conn.execute(
        "INSERT INTO error_log (severity, category, message, raised_time) VALUES (?1, ?2, ?3, ?4)",
        params![
            severity.as_str(),
            category.as_str(),
            message,
            to_sql_time(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl ErrorLogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<ErrorLogRow> {
        let severity: String = row.get("severity")?;
        let category: String = row.get("category")?;
        let raised: String = row.get("raised_time")?;
        Ok(ErrorLogRow {
            id: row.get("id")?,
            severity: ErrorSeverity::from_str_opt(&severity).unwrap_or(ErrorSeverity::Error),
            category: ErrorCategory::from_str_opt(&category).unwrap_or(ErrorCategory::Internal),
            message: row.get("message")?,
            raised_time: from_sql_time(&raised).unwrap_or_else(|_| Utc::now()),
            cleared: row.get::<_, i64>("cleared")? != 0,
        })
    }

    pub fn with_category(conn: &Connection, category: ErrorCategory) -> Result<Vec<ErrorLogRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, severity, category, message, raised_time, cleared
             FROM error_log WHERE category = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![category.as_str()], ErrorLogRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn clear(conn: &Connection, id: i64) -> Result<()> {
        conn.execute(
            "UPDATE error_log SET cleared = 1, cleared_time = ?1 WHERE id = ?2",
            params![to_sql_time(Utc::now()), id],
        )?;
        Ok(())
    }
}

/// One recorded run of a background task.
#[derive(Debug, Clone)]
pub struct BackgroundTaskRun {
    pub id: i64,
    pub task_name: String,
}

impl BackgroundTaskRun {
    pub fn start(conn: &Connection, task_name: &str) -> Result<BackgroundTaskRun> {
        conn.execute(
            "INSERT INTO background_task_log (task_name, start_time) VALUES (?1, ?2)",
            params![task_name, to_sql_time(Utc::now())],
        )?;
        Ok(BackgroundTaskRun {
            id: conn.last_insert_rowid(),
            task_name: task_name.to_string(),
        })
    }

    pub fn finish(&self, conn: &Connection, success: bool) -> Result<()> {
        conn.execute(
            "UPDATE background_task_log SET end_time = ?1, success = ?2 WHERE id = ?3",
            params![to_sql_time(Utc::now()), success as i64, self.id],
        )?;
        Ok(())
    }
}

/// Claim a task for this worker with a conditional update; `false` means
/// another worker holds it. Claims older than an hour are treated as
/// abandoned by a dead worker and stolen.
pub fn claim_task(conn: &Connection, task_name: &str) -> Result<bool> {
    conn.execute(
        "INSERT OR IGNORE INTO task_claims (task_name, claimed_at) VALUES (?1, NULL)",
        params![task_name],
    )?;
    let stale = to_sql_time(Utc::now() - chrono::Duration::hours(1));
    let changed = conn.execute(
        "UPDATE task_claims SET claimed_at = ?1
         WHERE task_name = ?2 AND (claimed_at IS NULL OR claimed_at < ?3)",
        params![to_sql_time(Utc::now()), task_name, stale],
    )?;
    Ok(changed > 0)
}

pub fn release_task(conn: &Connection, task_name: &str) -> Result<()> {
    conn.execute(
        "UPDATE task_claims SET claimed_at = NULL WHERE task_name = ?1",
        params![task_name],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn error_rows_are_queryable_by_category() {
        let db = Database::open_in_memory().unwrap();
        log_error(
            db.conn(),
            ErrorSeverity::Warning,
            ErrorCategory::Transport,
            "transfer 12 failed",
        )
        .unwrap();
        log_error(
            db.conn(),
            ErrorSeverity::Critical,
            ErrorCategory::Integrity,
            "checksum mismatch",
        )
        .unwrap();

        let transport = ErrorLogRow::with_category(db.conn(), ErrorCategory::Transport).unwrap();
        assert_eq!(transport.len(), 1);
        assert_eq!(transport[0].severity, ErrorSeverity::Warning);
    }

    #[test]
    fn task_claims_are_exclusive() {
        let db = Database::open_in_memory().unwrap();
        assert!(claim_task(db.conn(), "send_clone").unwrap());
        // Second claim while held fails.
        assert!(!claim_task(db.conn(), "send_clone").unwrap());

        release_task(db.conn(), "send_clone").unwrap();
        assert!(claim_task(db.conn(), "send_clone").unwrap());
    }

    #[test]
    fn task_runs_record_outcome() {
        let db = Database::open_in_memory().unwrap();
        let run = BackgroundTaskRun::start(db.conn(), "check_integrity").unwrap();
        run.finish(db.conn(), true).unwrap();

        let success: i64 = db
            .conn()
            .query_row(
                "SELECT success FROM background_task_log WHERE id = ?1",
                [run.id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(success, 1);
    }
}
