//! Storage drivers and transfer managers.
//!
//! A store is a storage backend with a staging area and a commit area.
//! Orchestration code programs against the [`StoreDriver`] capability set
//! only; concrete drivers are selected by a `store_type` tag at
//! configuration time. The reference driver is a local POSIX filesystem.

pub mod async_transfer;
pub mod error;
pub mod local;
pub mod pathinfo;
pub mod transfer;

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use arca_protocol::Checksum;

pub use error::{Result, StoreError};
pub use pathinfo::{checksum_of_bytes, PathInfo};

/// A staged-write slot: a unique directory under the staging root plus the
/// path inside it the bytes should land at. The slot is released by
/// `commit` or by an explicit `unstage`.
#[derive(Debug, Clone)]
pub struct StagedEntry {
    /// Unique per-transfer staging directory (absolute).
    pub dir: PathBuf,
    /// Destination for the incoming bytes inside `dir` (absolute).
    pub path: PathBuf,
}

/// Capacity snapshot of a store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreReport {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    /// True once `used >= report_full_fraction * capacity`.
    pub full: bool,
}

/// One entry found while scanning a store for reconciliation.
#[derive(Debug, Clone)]
pub struct EnumeratedEntry {
    /// Path relative to the store root.
    pub relative_path: String,
    pub size: u64,
    pub checksum: Checksum,
}

/// Abstract storage backend with staged-write and atomic commit.
pub trait StoreDriver: Send + Sync {
    /// Allocate a unique staging slot for `name`. Fails when the store is
    /// unreachable or accepting the bytes would exceed capacity.
    fn stage(&self, name: &str, expected_size: u64) -> Result<StagedEntry>;

    /// Release a staging slot without committing, removing any bytes in it.
    fn unstage(&self, staging_dir: &Path) -> Result<()>;

    /// Verify the staged bytes against `expected` (streamed), then
    /// atomically move them into the store root under a path derived from
    /// `final_name`. Never overwrites: an existing target is an error.
    /// Returns the stable path relative to the store root.
    fn commit(&self, staged_path: &Path, final_name: &str, expected: &Checksum) -> Result<String>;

    /// Remove the bytes at an instance path. Metadata updates are the
    /// caller's responsibility.
    fn delete(&self, relative_path: &str) -> Result<()>;

    /// Capacity snapshot from the underlying filesystem.
    fn report(&self) -> Result<StoreReport>;

    /// Scan the committed entries for reconciliation.
    fn enumerate(&self) -> Result<Vec<EnumeratedEntry>>;

    /// Whether the configured roots are physically reachable.
    fn available(&self) -> bool;

    /// Absolute path of an instance path.
    fn resolve(&self, relative_path: &str) -> Result<PathBuf>;

    /// Measure an instance (size + digest, flat or tree).
    fn path_info(&self, relative_path: &str) -> Result<PathInfo>;

    /// Names of the synchronous transfer managers this store accepts.
    fn transfer_managers(&self) -> Vec<String>;

    /// Names of the asynchronous transfer managers this store accepts.
    fn async_transfer_managers(&self) -> Vec<String>;

    /// Identifier of the endpoint from which async transports reach this
    /// store (a hostname for rsync-style transports).
    fn async_endpoint(&self) -> String;
}

/// Build a store driver from its configuration tag and data blob.
pub fn store_driver_from_config(
    store_type: &str,
    store_data: &serde_json::Value,
) -> Result<Box<dyn StoreDriver>> {
    match store_type {
        "local" => {
            let config: local::LocalStoreConfig = serde_json::from_value(store_data.clone())
                .map_err(|e| StoreError::Config(format!("local store: {e}")))?;
            Ok(Box::new(local::LocalStoreDriver::new(config)?))
        }
        other => Err(StoreError::UnsupportedStoreType(other.to_string())),
    }
}

/// Reject instance names and relative paths that could escape a store root.
pub(crate) fn validate_relative(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(StoreError::UnsafePath("empty".into()));
    }
    if path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return Err(StoreError::UnsafePath(path.to_string()));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(StoreError::UnsafePath(path.to_string())),
        }
    }
    Ok(())
}

/// Total size in bytes of all files under `path`.
pub(crate) fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_dir() {
                total += dir_size(&p);
            } else if let Ok(meta) = p.metadata() {
                total += meta.len();
            }
        }
    }
    total
}
