//! Size and digest measurement for on-disk entries.
//!
//! A File may be a flat byte stream or a directory subtree. Flat files hash
//! to the plain MD5 of their bytes. Directories hash to the MD5 of a
//! canonical uncompressed stream: entries are walked recursively and sorted
//! bytewise by their `/`-joined relative path; for each entry the stream
//! contains the path bytes, one NUL, the content length as a big-endian
//! u64, then the raw contents. Empty directories contribute nothing.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use walkdir::WalkDir;

use arca_protocol::Checksum;

use crate::error::{Result, StoreError};

const READ_BUF_SIZE: usize = 256 * 1024;

/// Measured size and digest of a path.
#[derive(Debug, Clone)]
pub struct PathInfo {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: Checksum,
    pub is_dir: bool,
}

impl PathInfo {
    /// Measure a flat file or a directory subtree.
    pub fn for_path(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            let (size, checksum) = hash_tree(path)?;
            Ok(PathInfo {
                path: path.to_path_buf(),
                size,
                checksum,
                is_dir: true,
            })
        } else {
            let (size, checksum) = hash_file(path)?;
            Ok(PathInfo {
                path: path.to_path_buf(),
                size,
                checksum,
                is_dir: false,
            })
        }
    }
}

/// MD5 of a byte slice; used for small in-memory payloads and tests.
pub fn checksum_of_bytes(bytes: &[u8]) -> Checksum {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    Checksum::from_digest_bytes(&hasher.finalize())
}

fn hash_file(path: &Path) -> Result<(u64, Checksum)> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((size, Checksum::from_digest_bytes(&hasher.finalize())))
}

fn hash_tree(root: &Path) -> Result<(u64, Checksum)> {
    let mut entries: Vec<(String, PathBuf, u64)> = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| {
            StoreError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walk error")
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| StoreError::UnsafePath(entry.path().display().to_string()))?;
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push((key, entry.path().to_path_buf(), size));
    }
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut hasher = Md5::new();
    let mut total = 0u64;
    let mut buf = vec![0u8; READ_BUF_SIZE];
    for (key, path, size) in &entries {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(size.to_be_bytes());
        let mut file = File::open(path)?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            hasher.update(&buf[..n]);
        }
    }
    Ok((total, Checksum::from_digest_bytes(&hasher.finalize())))
}
