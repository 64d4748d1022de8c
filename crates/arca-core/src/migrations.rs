//! Schema migrations, applied in order at every open. The `schema_version`
//! pragma tracks the last applied migration.

use rusqlite::Connection;

use crate::error::Result;

const MIGRATIONS: &[(&str, &str)] = &[("v001_initial", V001_INITIAL)];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    for (index, (name, sql)) in MIGRATIONS.iter().enumerate() {
        let version = (index + 1) as i64;
        if version <= current {
            continue;
        }
        tracing::info!(migration = name, "applying schema migration");
        conn.execute_batch(sql)?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}

const V001_INITIAL: &str = r#"
CREATE TABLE files (
    name            TEXT PRIMARY KEY,
    create_time     TEXT NOT NULL,
    size            INTEGER NOT NULL,
    checksum        TEXT NOT NULL,
    uploader        TEXT NOT NULL,
    source          TEXT NOT NULL,
    observation_id  INTEGER,
    session_id      INTEGER
);

CREATE TABLE stores (
    id                          INTEGER PRIMARY KEY AUTOINCREMENT,
    name                        TEXT NOT NULL UNIQUE,
    store_type                  TEXT NOT NULL,
    ingestible                  INTEGER NOT NULL DEFAULT 1,
    enabled                     INTEGER NOT NULL DEFAULT 1,
    store_data                  TEXT NOT NULL,
    transfer_manager_data       TEXT NOT NULL DEFAULT '{}',
    async_transfer_manager_data TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE instances (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name       TEXT NOT NULL REFERENCES files(name),
    store_id        INTEGER NOT NULL REFERENCES stores(id),
    path            TEXT NOT NULL,
    deletion_policy TEXT NOT NULL DEFAULT 'DISALLOWED',
    available       INTEGER NOT NULL DEFAULT 1,
    created_time    TEXT NOT NULL,
    UNIQUE (file_name, store_id, path)
);
CREATE INDEX idx_instances_file ON instances(file_name);

CREATE TABLE librarians (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    name              TEXT NOT NULL UNIQUE,
    url               TEXT NOT NULL,
    port              INTEGER NOT NULL,
    authenticator     TEXT NOT NULL,
    transfers_enabled INTEGER NOT NULL DEFAULT 1,
    last_seen         TEXT,
    last_error        TEXT
);

CREATE TABLE remote_instances (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name    TEXT NOT NULL REFERENCES files(name),
    librarian_id INTEGER NOT NULL REFERENCES librarians(id),
    store_name   TEXT,
    copy_time    TEXT NOT NULL,
    UNIQUE (file_name, librarian_id)
);

CREATE TABLE users (
    username      TEXT PRIMARY KEY,
    password_hash TEXT NOT NULL,
    auth_level    INTEGER NOT NULL
);

CREATE TABLE incoming_transfers (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    status             TEXT NOT NULL,
    source             TEXT NOT NULL,
    source_transfer_id INTEGER,
    uploader           TEXT NOT NULL,
    upload_name        TEXT NOT NULL,
    transfer_size      INTEGER NOT NULL,
    transfer_checksum  TEXT NOT NULL,
    store_id           INTEGER REFERENCES stores(id),
    staging_path       TEXT,
    store_path         TEXT,
    start_time         TEXT NOT NULL,
    end_time           TEXT,
    error              TEXT,
    UNIQUE (source, source_transfer_id)
);

CREATE TABLE send_queue (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    priority             INTEGER NOT NULL DEFAULT 0,
    created_time         TEXT NOT NULL,
    retries              INTEGER NOT NULL DEFAULT 0,
    destination          TEXT NOT NULL,
    destination_endpoint TEXT NOT NULL,
    async_manager_name   TEXT NOT NULL,
    transfer_handle      TEXT,
    consumed             INTEGER NOT NULL DEFAULT 0,
    consumed_time        TEXT,
    completed            INTEGER NOT NULL DEFAULT 0,
    completed_time       TEXT,
    failed               INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE outgoing_transfers (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    status                TEXT NOT NULL,
    destination           TEXT NOT NULL,
    file_name             TEXT NOT NULL REFERENCES files(name),
    instance_id           INTEGER REFERENCES instances(id),
    store_id              INTEGER REFERENCES stores(id),
    transfer_size         INTEGER NOT NULL,
    transfer_checksum     TEXT NOT NULL,
    remote_transfer_id    INTEGER,
    transfer_manager_name TEXT,
    source_path           TEXT,
    dest_path             TEXT,
    batch_id              TEXT,
    send_queue_id         INTEGER REFERENCES send_queue(id),
    start_time            TEXT NOT NULL,
    end_time              TEXT,
    error                 TEXT
);
CREATE UNIQUE INDEX idx_outgoing_live
    ON outgoing_transfers(destination, file_name)
    WHERE status IN ('INITIATED', 'ONGOING', 'STAGED');

CREATE TABLE error_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    severity     TEXT NOT NULL,
    category     TEXT NOT NULL,
    message      TEXT NOT NULL,
    raised_time  TEXT NOT NULL,
    cleared      INTEGER NOT NULL DEFAULT 0,
    cleared_time TEXT
);

CREATE TABLE background_task_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_name  TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time   TEXT,
    success    INTEGER
);

CREATE TABLE task_claims (
    task_name  TEXT PRIMARY KEY,
    claimed_at TEXT
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }
}
