//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations have run before any other operation. Connections are
//! shared between the API surface and the background worker behind a mutex;
//! all queries are short and synchronous, so the guard is never held across
//! a suspension point.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{CoreError, Result};
use crate::migrations;

/// Backoff ladder for transient commit failures: fixed three attempts.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_millis(2000),
];

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database file, applying pragmas and migrations.
    pub fn open_at(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(250))?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Run `f` inside a transaction, retrying the whole unit on transient
    /// lock contention with the fixed 100 ms / 500 ms / 2 s ladder. The
    /// transaction rolls back whenever `f` errors, so no partial state
    /// survives a failed attempt.
    pub fn transaction<T>(
        &mut self,
        mut f: impl FnMut(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            let result: Result<T> = (|| {
                let tx = self.conn.transaction()?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })();

            match result {
                Ok(value) => return Ok(value),
                Err(CoreError::Database(e)) if is_transient(&e) && attempt < RETRY_DELAYS.len() => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "transient database error, retrying transaction"
                    );
                    std::thread::sleep(RETRY_DELAYS[attempt]);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// The database handle shared between the API surface and workers.
pub type SharedDb = Arc<Mutex<Database>>;

pub fn shared(db: Database) -> SharedDb {
    Arc::new(Mutex::new(db))
}

/// Acquire the shared handle, recovering from a poisoned lock: the inner
/// state is a plain connection and stays usable after a panicking holder.
pub fn lock_db(db: &SharedDb) -> MutexGuard<'_, Database> {
    match db.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("database mutex poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}

/// Uniform RFC 3339 timestamp encoding. Microsecond precision with a `Z`
/// suffix keeps the stored strings lexicographically ordered, so range
/// filters work directly in SQL.
pub fn to_sql_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_sql_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::Config(format!("bad timestamp '{s}' in database: {e}")))
}
