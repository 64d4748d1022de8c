//! Files: the immutable unit of metadata. A File row is created at ingest
//! and never updated; copies come and go as Instances and RemoteInstances.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use arca_protocol::search::FileSearchRequest;
use arca_protocol::Checksum;

use crate::db::{from_sql_time, to_sql_time};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct File {
    pub name: String,
    pub create_time: DateTime<Utc>,
    pub size: u64,
    pub checksum: Checksum,
    pub uploader: String,
    pub source: String,
    pub observation_id: Option<i64>,
    pub session_id: Option<i64>,
}

impl File {
    /// Reject names with directory separators or traversal components;
    /// file names are flat identifiers, globally unique per instance.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
            || name == "."
            || name == ".."
        {
            return Err(CoreError::Config(format!("invalid file name '{name}'")));
        }
        Ok(())
    }

    pub fn create(
        conn: &Connection,
        name: &str,
        size: u64,
        checksum: &Checksum,
        uploader: &str,
        source: &str,
    ) -> Result<File> {
        Self::validate_name(name)?;
        let file = File {
            name: name.to_string(),
            create_time: Utc::now(),
            size,
            checksum: checksum.clone(),
            uploader: uploader.to_string(),
            source: source.to_string(),
            observation_id: None,
            session_id: None,
        };
        conn.execute(
            "INSERT INTO files (name, create_time, size, checksum, uploader, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                file.name,
                to_sql_time(file.create_time),
                file.size as i64,
                file.checksum.as_str(),
                file.uploader,
                file.source,
            ],
        )?;
        Ok(file)
    }

    pub fn get(conn: &Connection, name: &str) -> Result<Option<File>> {
        conn.query_row(
            "SELECT name, create_time, size, checksum, uploader, source,
                    observation_id, session_id
             FROM files WHERE name = ?1",
            params![name],
            File::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn exists(conn: &Connection, name: &str) -> Result<bool> {
        Ok(Self::get(conn, name)?.is_some())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<File> {
        let create_time: String = row.get("create_time")?;
        let checksum: String = row.get("checksum")?;
        Ok(File {
            name: row.get("name")?,
            create_time: from_sql_time(&create_time).unwrap_or_else(|_| Utc::now()),
            size: row.get::<_, i64>("size")? as u64,
            checksum: Checksum::parse(&checksum).unwrap_or_else(|_| Checksum::from_digest_bytes(&[])),
            uploader: row.get("uploader")?,
            source: row.get("source")?,
            observation_id: row.get("observation_id")?,
            session_id: row.get("session_id")?,
        })
    }

    /// Flat-filter search. All present filters are ANDed; `cap` bounds the
    /// result count (already clamped by the caller for non-admin users).
    pub fn search(conn: &Connection, filters: &FileSearchRequest, cap: usize) -> Result<Vec<File>> {
        let mut sql = String::from(
            "SELECT name, create_time, size, checksum, uploader, source,
                    observation_id, session_id
             FROM files WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(name) = &filters.name {
            sql.push_str(" AND name = ?");
            args.push(Box::new(name.clone()));
        }
        if let Some(pattern) = &filters.name_like {
            sql.push_str(" AND name LIKE ?");
            args.push(Box::new(format!("%{pattern}%")));
        }
        if let Some(uploader) = &filters.uploader {
            sql.push_str(" AND uploader = ?");
            args.push(Box::new(uploader.clone()));
        }
        if let Some(source) = &filters.source {
            sql.push_str(" AND source = ?");
            args.push(Box::new(source.clone()));
        }
        if let Some(after) = filters.created_after {
            sql.push_str(" AND create_time >= ?");
            args.push(Box::new(to_sql_time(after)));
        }
        if let Some(before) = filters.created_before {
            sql.push_str(" AND create_time < ?");
            args.push(Box::new(to_sql_time(before)));
        }
        if let Some(min) = filters.min_size {
            sql.push_str(" AND size >= ?");
            args.push(Box::new(min as i64));
        }
        if let Some(max) = filters.max_size {
            sql.push_str(" AND size <= ?");
            args.push(Box::new(max as i64));
        }

        sql.push_str(" ORDER BY create_time DESC LIMIT ?");
        args.push(Box::new(cap as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            File::from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Files older than `age_in_days` lacking both a RemoteInstance at the
    /// destination and a live OutgoingTransfer to it. The send task's
    /// candidate query.
    pub fn needing_clone_to(
        conn: &Connection,
        destination: &str,
        age_in_days: i64,
        limit: usize,
    ) -> Result<Vec<File>> {
        let cutoff = to_sql_time(Utc::now() - chrono::Duration::days(age_in_days));
        let mut stmt = conn.prepare(
            "SELECT f.name, f.create_time, f.size, f.checksum, f.uploader, f.source,
                    f.observation_id, f.session_id
             FROM files f
             WHERE f.create_time <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM remote_instances ri
                   JOIN librarians l ON l.id = ri.librarian_id
                   WHERE ri.file_name = f.name AND l.name = ?2)
               AND NOT EXISTS (
                   SELECT 1 FROM outgoing_transfers ot
                   WHERE ot.file_name = f.name AND ot.destination = ?2
                     AND ot.status IN ('INITIATED', 'ONGOING', 'STAGED'))
             ORDER BY f.create_time ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![cutoff, destination, limit as i64], File::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Files older than `age_in_days` with an available instance on
    /// `from_store_id` but none on any of `to_store_ids`. The local
    /// cloner's candidate query.
    pub fn needing_local_clone(
        conn: &Connection,
        from_store_id: i64,
        to_store_ids: &[i64],
        age_in_days: i64,
        limit: usize,
    ) -> Result<Vec<File>> {
        let cutoff = to_sql_time(Utc::now() - chrono::Duration::days(age_in_days));
        let placeholders = to_store_ids
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT f.name, f.create_time, f.size, f.checksum, f.uploader, f.source,
                    f.observation_id, f.session_id
             FROM files f
             WHERE f.create_time <= ?
               AND EXISTS (
                   SELECT 1 FROM instances i
                   WHERE i.file_name = f.name AND i.store_id = ? AND i.available = 1)
               AND NOT EXISTS (
                   SELECT 1 FROM instances i
                   WHERE i.file_name = f.name AND i.store_id IN ({placeholders}))
             ORDER BY f.create_time ASC
             LIMIT ?"
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(cutoff), Box::new(from_store_id)];
        for id in to_store_ids {
            args.push(Box::new(*id));
        }
        args.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            File::from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Files created within the last `age_in_days` that hold an available
    /// instance on `store_id`. The integrity checker's candidate query.
    pub fn recent_on_store(
        conn: &Connection,
        store_id: i64,
        age_in_days: i64,
    ) -> Result<Vec<File>> {
        let cutoff = to_sql_time(Utc::now() - chrono::Duration::days(age_in_days));
        let mut stmt = conn.prepare(
            "SELECT DISTINCT f.name, f.create_time, f.size, f.checksum, f.uploader, f.source,
                    f.observation_id, f.session_id
             FROM files f
             JOIN instances i ON i.file_name = f.name
             WHERE f.create_time >= ?1 AND i.store_id = ?2 AND i.available = 1
             ORDER BY f.create_time ASC",
        )?;
        let rows = stmt.query_map(params![cutoff, store_id], File::from_row)?;
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

    fn checksum(hex: &str) -> Checksum {
        Checksum::parse(hex).unwrap()
    }

    #[test]
    fn create_and_get() {
        let db = Database::open_in_memory().unwrap();
        let c = checksum("440d5758b601be7fbee75ae3d41c7262");
        File::create(db.conn(), "test.txt", 8, &c, "alice", "site-a").unwrap();

        let file = File::get(db.conn(), "test.txt").unwrap().unwrap();
        assert_eq!(file.size, 8);
        assert!(file.checksum.matches(&c));
        assert!(File::get(db.conn(), "absent").unwrap().is_none());
    }

    #[test]
    fn names_are_unique() {
        let db = Database::open_in_memory().unwrap();
        let c = checksum("00000000000000000000000000000000");
        File::create(db.conn(), "dup.dat", 1, &c, "alice", "site-a").unwrap();
        assert!(File::create(db.conn(), "dup.dat", 1, &c, "alice", "site-a").is_err());
    }

    #[test]
    fn names_with_separators_rejected() {
        let db = Database::open_in_memory().unwrap();
        let c = checksum("00000000000000000000000000000000");
        for bad in ["a/b", "a\\b", "", "..", "."] {
            assert!(File::create(db.conn(), bad, 1, &c, "u", "s").is_err(), "{bad}");
        }
    }

    #[test]
    fn search_filters_combine() {
        let db = Database::open_in_memory().unwrap();
        let c = checksum("00000000000000000000000000000000");
        File::create(db.conn(), "zen.2457644.12345.uv", 100, &c, "alice", "a").unwrap();
        File::create(db.conn(), "zen.2457645.12345.uv", 200, &c, "bob", "a").unwrap();
        File::create(db.conn(), "cal.dat", 300, &c, "alice", "b").unwrap();

        let by_like = File::search(
            db.conn(),
            &FileSearchRequest {
                name_like: Some("zen.".into()),
                ..Default::default()
            },
            100,
        )
        .unwrap();
        assert_eq!(by_like.len(), 2);

        let by_both = File::search(
            db.conn(),
            &FileSearchRequest {
                name_like: Some("zen.".into()),
                uploader: Some("alice".into()),
                ..Default::default()
            },
            100,
        )
        .unwrap();
        assert_eq!(by_both.len(), 1);
        assert_eq!(by_both[0].name, "zen.2457644.12345.uv");

        let by_size = File::search(
            db.conn(),
            &FileSearchRequest {
                min_size: Some(150),
                max_size: Some(250),
                ..Default::default()
            },
            100,
        )
        .unwrap();
        assert_eq!(by_size.len(), 1);
        assert_eq!(by_size[0].size, 200);
    }

    #[test]
    fn search_respects_cap() {
        let db = Database::open_in_memory().unwrap();
        let c = checksum("00000000000000000000000000000000");
        for i in 0..10 {
            File::create(db.conn(), &format!("f{i}.dat"), 1, &c, "u", "s").unwrap();
        }
        let capped = File::search(db.conn(), &FileSearchRequest::default(), 3).unwrap();
        assert_eq!(capped.len(), 3);
    }
}
