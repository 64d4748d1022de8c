//! Instances: local on-disk realisations of a File on a Store, and
//! RemoteInstances: recorded claims that a named peer holds a copy.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{from_sql_time, to_sql_time};
use crate::error::{CoreError, Result};

/// Whether an instance may later be removed by the local administrator.
/// Agreed between peers at clone time and enforced at both the API layer
/// and here in the model layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPolicy {
    Allowed,
    Disallowed,
}

impl DeletionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionPolicy::Allowed => "ALLOWED",
            DeletionPolicy::Disallowed => "DISALLOWED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "ALLOWED" => Some(DeletionPolicy::Allowed),
            "DISALLOWED" => Some(DeletionPolicy::Disallowed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: i64,
    pub file_name: String,
    pub store_id: i64,
    pub path: String,
    pub deletion_policy: DeletionPolicy,
    pub available: bool,
    pub created_time: DateTime<Utc>,
}

impl Instance {
    pub fn create(
        conn: &Connection,
        file_name: &str,
        store_id: i64,
        path: &str,
        deletion_policy: DeletionPolicy,
    ) -> Result<Instance> {
        let created_time = Utc::now();
        conn.execute(
            "INSERT INTO instances (file_name, store_id, path, deletion_policy, available, created_time)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                file_name,
                store_id,
                path,
                deletion_policy.as_str(),
                to_sql_time(created_time),
            ],
        )?;
        Ok(Instance {
            id: conn.last_insert_rowid(),
            file_name: file_name.to_string(),
            store_id,
            path: path.to_string(),
            deletion_policy,
            available: true,
            created_time,
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Instance> {
        let policy: String = row.get("deletion_policy")?;
        let created: String = row.get("created_time")?;
        Ok(Instance {
            id: row.get("id")?,
            file_name: row.get("file_name")?,
            store_id: row.get("store_id")?,
            path: row.get("path")?,
            deletion_policy: DeletionPolicy::from_str_opt(&policy)
                .unwrap_or(DeletionPolicy::Disallowed),
            available: row.get::<_, i64>("available")? != 0,
            created_time: from_sql_time(&created).unwrap_or_else(|_| Utc::now()),
        })
    }

    const COLUMNS: &'static str =
        "id, file_name, store_id, path, deletion_policy, available, created_time";

    pub fn get(conn: &Connection, id: i64) -> Result<Option<Instance>> {
        conn.query_row(
            &format!("SELECT {} FROM instances WHERE id = ?1", Self::COLUMNS),
            params![id],
            Instance::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn for_file(conn: &Connection, file_name: &str) -> Result<Vec<Instance>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM instances WHERE file_name = ?1 ORDER BY id",
            Self::COLUMNS
        ))?;
        let rows = stmt.query_map(params![file_name], Instance::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find(conn: &Connection, file_name: &str, store_id: i64) -> Result<Option<Instance>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM instances WHERE file_name = ?1 AND store_id = ?2",
                Self::COLUMNS
            ),
            params![file_name, store_id],
            Instance::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    /// Soft delete. Refuses when the deletion policy disallows removal,
    /// unless `force` (integrity failures mark instances unavailable
    /// regardless of policy, since the bytes are already bad).
    pub fn mark_unavailable(&self, conn: &Connection, force: bool) -> Result<()> {
        if !force && self.deletion_policy == DeletionPolicy::Disallowed {
            return Err(CoreError::DeletionDisallowed(self.id));
        }
        conn.execute(
            "UPDATE instances SET available = 0 WHERE id = ?1",
            params![self.id],
        )?;
        Ok(())
    }

    pub fn mark_available(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE instances SET available = 1 WHERE id = ?1",
            params![self.id],
        )?;
        Ok(())
    }

    /// Hard delete of the metadata row; byte removal is the store
    /// adapter's job and happens first.
    pub fn remove(&self, conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM instances WHERE id = ?1", params![self.id])?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RemoteInstance {
    pub id: i64,
    pub file_name: String,
    pub librarian_id: i64,
    pub store_name: Option<String>,
    pub copy_time: DateTime<Utc>,
}

impl RemoteInstance {
    /// Record that a peer confirmed ingestion. Idempotent: a duplicate
    /// claim for the same (file, librarian) is ignored.
    pub fn create(
        conn: &Connection,
        file_name: &str,
        librarian_id: i64,
        store_name: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO remote_instances (file_name, librarian_id, store_name, copy_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![file_name, librarian_id, store_name, to_sql_time(Utc::now())],
        )?;
        Ok(())
    }

    pub fn for_file(conn: &Connection, file_name: &str) -> Result<Vec<RemoteInstance>> {
        let mut stmt = conn.prepare(
            "SELECT id, file_name, librarian_id, store_name, copy_time
             FROM remote_instances WHERE file_name = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![file_name], |row| {
            let copy_time: String = row.get("copy_time")?;
            Ok(RemoteInstance {
                id: row.get("id")?,
                file_name: row.get("file_name")?,
                librarian_id: row.get("librarian_id")?,
                store_name: row.get("store_name")?,
                copy_time: from_sql_time(&copy_time).unwrap_or_else(|_| Utc::now()),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn exists(conn: &Connection, file_name: &str, librarian_id: i64) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM remote_instances WHERE file_name = ?1 AND librarian_id = ?2",
            params![file_name, librarian_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }
}
