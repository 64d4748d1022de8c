//! Synchronous transfer managers: client→server ingest and intra-server
//! copies. `submit` blocks until the bytes are in place.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// A blocking byte mover. `submit` returns once the destination holds a
/// complete copy; hash verification is the caller's job (it happens at
/// commit time).
pub trait TransferManager: Send + Sync {
    fn submit(&self, source: &Path, destination: &Path) -> Result<()>;

    /// Trivially complete for blocking managers.
    fn poll(&self) -> bool {
        true
    }

    /// Best-effort interrupt; the reference manager cannot cancel.
    fn cancel(&self) {}

    fn describe(&self) -> String;
}

/// Reference manager: plain filesystem copy. Handles both flat files and
/// directory subtrees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalTransferManager {}

impl TransferManager for LocalTransferManager {
    fn submit(&self, source: &Path, destination: &Path) -> Result<()> {
        if !source.exists() {
            return Err(StoreError::TransferFailed(format!(
                "source '{}' does not exist",
                source.display()
            )));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_entry(source, destination)
    }

    fn describe(&self) -> String {
        "local filesystem copy".to_string()
    }
}

fn copy_entry(source: &Path, destination: &Path) -> Result<()> {
    let meta = fs::metadata(source)?;
    if meta.is_dir() {
        fs::create_dir_all(destination)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_entry(&entry.path(), &destination.join(entry.file_name()))?;
        }
    } else {
        fs::copy(source, destination)?;
    }
    Ok(())
}

/// Build a synchronous transfer manager by its configuration tag.
pub fn transfer_manager_from_config(name: &str) -> Result<Box<dyn TransferManager>> {
    match name {
        "local" => Ok(Box::new(LocalTransferManager::default())),
        other => Err(StoreError::UnsupportedTransferManager(other.to_string())),
    }
}
