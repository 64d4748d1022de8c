//! The shared ingest path: take verified staged bytes and turn them into a
//! committed instance plus metadata rows. Used by the upload surface, the
//! receive-clone worker, and SneakerNet manifest ingestion.

use std::path::Path;

use rusqlite::Connection;

use arca_protocol::Checksum;

use crate::error::{CoreError, Result};
use crate::models::{DeletionPolicy, File, Instance, StoreRow};

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub instance_id: i64,
    pub instance_path: String,
    /// True when the file already existed with an identical checksum and
    /// nothing had to be committed.
    pub already_present: bool,
}

/// Commit staged bytes as `name` and record File + Instance rows.
///
/// Redelivery semantics: if a File named `name` already exists with the
/// same checksum, the ingest is a no-op success (the staged bytes are
/// discarded); with a different checksum the name collision is fatal and
/// the staged bytes are left for the caller to unstage.
#[allow(clippy::too_many_arguments)]
pub fn ingest_staged_file(
    conn: &Connection,
    store: &StoreRow,
    staged_path: &Path,
    name: &str,
    size: u64,
    checksum: &Checksum,
    uploader: &str,
    source: &str,
    deletion_policy: DeletionPolicy,
) -> Result<IngestOutcome> {
    let driver = store.driver()?;

    if let Some(existing) = File::get(conn, name)? {
        if !existing.checksum.matches(checksum) {
            return Err(CoreError::FileConflict(name.to_string()));
        }
        // Identical redelivery. Keep the copy we already have.
        if let Some(instance) = Instance::find(conn, name, store.id)? {
            if let Some(dir) = staged_path.parent() {
                let _ = driver.unstage(dir);
            }
            return Ok(IngestOutcome {
                instance_id: instance.id,
                instance_path: instance.path,
                already_present: true,
            });
        }
        // File known but no local instance on this store: commit the copy.
        let path = driver.commit(staged_path, name, checksum)?;
        let instance = Instance::create(conn, name, store.id, &path, deletion_policy)?;
        return Ok(IngestOutcome {
            instance_id: instance.id,
            instance_path: instance.path,
            already_present: false,
        });
    }

    let path = driver.commit(staged_path, name, checksum)?;
    File::create(conn, name, size, checksum, uploader, source)?;
    let instance = Instance::create(conn, name, store.id, &path, deletion_policy)?;
    Ok(IngestOutcome {
        instance_id: instance.id,
        instance_path: instance.path,
        already_present: false,
    })
}
