//! Local POSIX filesystem store driver.
//!
//! Layout: a staging root holding one unique directory per in-flight
//! transfer, and a store root holding committed instances under their
//! final names. Commit verifies the digest against the staged bytes, then
//! renames into place; rename is atomic on POSIX so a committed path is
//! either absent or complete.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use arca_protocol::Checksum;

use crate::error::{Result, StoreError};
use crate::pathinfo::PathInfo;
use crate::{dir_size, validate_relative, EnumeratedEntry, StagedEntry, StoreDriver, StoreReport};

fn default_full_fraction() -> f64 {
    1.0
}

/// Post-commit ownership policy (unix uid/gid).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OwnershipPolicy {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    pub staging_path: PathBuf,
    pub store_path: PathBuf,
    pub capacity_bytes: u64,
    #[serde(default = "default_full_fraction")]
    pub report_full_fraction: f64,
    #[serde(default)]
    pub group_write_after_stage: bool,
    #[serde(default)]
    pub own_after_commit: Option<OwnershipPolicy>,
    #[serde(default)]
    pub readonly_after_commit: bool,
    /// Hostname async transports use to reach this store's staging area.
    #[serde(default)]
    pub async_endpoint: Option<String>,
    /// Async transfer managers that can deliver into this store.
    #[serde(default = "default_async_managers")]
    pub accepted_async_managers: Vec<String>,
}

fn default_async_managers() -> Vec<String> {
    vec!["local_async".to_string(), "rsync".to_string()]
}

pub struct LocalStoreDriver {
    config: LocalStoreConfig,
}

impl LocalStoreDriver {
    pub fn new(config: LocalStoreConfig) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.report_full_fraction) || config.report_full_fraction == 0.0
        {
            return Err(StoreError::Config(format!(
                "report_full_fraction must be in (0, 1], got {}",
                config.report_full_fraction
            )));
        }
        fs::create_dir_all(&config.staging_path)?;
        fs::create_dir_all(&config.store_path)?;
        Ok(Self { config })
    }

    fn staging_root(&self) -> &Path {
        &self.config.staging_path
    }

    fn store_root(&self) -> &Path {
        &self.config.store_path
    }

    fn apply_commit_policies(&self, target: &Path) -> Result<()> {
        #[cfg(unix)]
        if let Some(own) = self.config.own_after_commit {
            std::os::unix::fs::chown(target, Some(own.uid), Some(own.gid))?;
        }
        if self.config.readonly_after_commit {
            set_readonly_recursive(target)?;
        }
        Ok(())
    }
}

impl StoreDriver for LocalStoreDriver {
    fn stage(&self, name: &str, expected_size: u64) -> Result<StagedEntry> {
        validate_relative(name)?;
        if !self.available() {
            return Err(StoreError::Unavailable);
        }

        let report = self.report()?;
        if report.full || expected_size > report.free {
            return Err(StoreError::NotEnoughSpace {
                needed: expected_size,
                available: report.free,
            });
        }

        // Per-transfer staging directories make collisions impossible.
        let token: u64 = rand::thread_rng().gen();
        let dir = self.staging_root().join(format!("stage-{token:016x}"));
        fs::create_dir(&dir)?;

        if self.config.group_write_after_stage {
            set_group_write(&dir)?;
        }

        let path = dir.join(name);
        Ok(StagedEntry { dir, path })
    }

    fn unstage(&self, staging_dir: &Path) -> Result<()> {
        if !staging_dir.starts_with(self.staging_root()) {
            return Err(StoreError::UnsafePath(staging_dir.display().to_string()));
        }
        match fs::remove_dir_all(staging_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, staged_path: &Path, final_name: &str, expected: &Checksum) -> Result<String> {
        validate_relative(final_name)?;
        if !staged_path.exists() {
            return Err(StoreError::StagedEntryMissing(
                staged_path.display().to_string(),
            ));
        }

        let info = PathInfo::for_path(staged_path)?;
        if !info.checksum.matches(expected) {
            return Err(StoreError::ChecksumMismatch {
                expected: expected.as_str().to_string(),
                actual: info.checksum.as_str().to_string(),
            });
        }

        let target = self.store_root().join(final_name);
        if target.exists() {
            return Err(StoreError::TargetExists(final_name.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::rename(staged_path, &target)?;
        self.apply_commit_policies(&target)?;

        // Release the now-empty staging slot.
        if let Some(dir) = staged_path.parent() {
            if dir.starts_with(self.staging_root()) {
                let _ = fs::remove_dir_all(dir);
            }
        }

        Ok(final_name.to_string())
    }

    fn delete(&self, relative_path: &str) -> Result<()> {
        let path = self.resolve(relative_path)?;
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn report(&self) -> Result<StoreReport> {
        let used = dir_size(self.store_root()) + dir_size(self.staging_root());
        let capacity = self.config.capacity_bytes;
        let free = capacity.saturating_sub(used);
        let threshold = (capacity as f64 * self.config.report_full_fraction) as u64;
        Ok(StoreReport {
            capacity,
            used,
            free,
            full: used >= threshold,
        })
    }

    fn enumerate(&self) -> Result<Vec<EnumeratedEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.store_root())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let info = PathInfo::for_path(&entry.path())?;
            out.push(EnumeratedEntry {
                relative_path: name,
                size: info.size,
                checksum: info.checksum,
            });
        }
        out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(out)
    }

    fn available(&self) -> bool {
        self.store_root().is_dir() && self.staging_root().is_dir()
    }

    fn resolve(&self, relative_path: &str) -> Result<PathBuf> {
        validate_relative(relative_path)?;
        Ok(self.store_root().join(relative_path))
    }

    fn path_info(&self, relative_path: &str) -> Result<PathInfo> {
        let path = self.resolve(relative_path)?;
        PathInfo::for_path(&path)
    }

    fn transfer_managers(&self) -> Vec<String> {
        vec!["local".to_string()]
    }

    fn async_transfer_managers(&self) -> Vec<String> {
        self.config.accepted_async_managers.clone()
    }

    fn async_endpoint(&self) -> String {
        self.config
            .async_endpoint
            .clone()
            .unwrap_or_else(|| "localhost".to_string())
    }
}

#[cfg(unix)]
fn set_group_write(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)?;
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o020);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_group_write(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_readonly_recursive(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            set_readonly_recursive(&entry?.path())?;
        }
        // Directories keep the execute bits so entries stay listable.
        fs::set_permissions(path, fs::Permissions::from_mode(0o555))?;
    } else {
        fs::set_permissions(path, fs::Permissions::from_mode(0o444))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_readonly_recursive(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathinfo::checksum_of_bytes;

    fn driver(capacity: u64) -> (LocalStoreDriver, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let driver = LocalStoreDriver::new(LocalStoreConfig {
            staging_path: tmp.path().join("staging"),
            store_path: tmp.path().join("store"),
            capacity_bytes: capacity,
            report_full_fraction: 1.0,
            group_write_after_stage: false,
            own_after_commit: None,
            readonly_after_commit: false,
            async_endpoint: None,
            accepted_async_managers: default_async_managers(),
        })
        .unwrap();
        (driver, tmp)
    }

    #[test]
    fn stage_commit_round_trip() {
        let (driver, _tmp) = driver(1 << 20);
        let payload = b"hello\nhe";

        let slot = driver.stage("test.txt", payload.len() as u64).unwrap();
        fs::write(&slot.path, payload).unwrap();

        let rel = driver
            .commit(&slot.path, "test.txt", &checksum_of_bytes(payload))
            .unwrap();
        assert_eq!(rel, "test.txt");

        let info = driver.path_info(&rel).unwrap();
        assert_eq!(info.size, 8);
        assert!(info.checksum.matches(&checksum_of_bytes(payload)));

        // Staging slot was released.
        assert!(!slot.dir.exists());
    }

    #[test]
    fn commit_rejects_checksum_mismatch() {
        let (driver, _tmp) = driver(1 << 20);
        let slot = driver.stage("bad.dat", 3).unwrap();
        fs::write(&slot.path, b"abc").unwrap();

        let err = driver
            .commit(&slot.path, "bad.dat", &checksum_of_bytes(b"xyz"))
            .unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn commit_never_overwrites() {
        let (driver, _tmp) = driver(1 << 20);
        let payload = b"first";
        let slot = driver.stage("dup.dat", 5).unwrap();
        fs::write(&slot.path, payload).unwrap();
        driver
            .commit(&slot.path, "dup.dat", &checksum_of_bytes(payload))
            .unwrap();

        let slot2 = driver.stage("dup.dat", 5).unwrap();
        fs::write(&slot2.path, payload).unwrap();
        let err = driver
            .commit(&slot2.path, "dup.dat", &checksum_of_bytes(payload))
            .unwrap_err();
        assert!(matches!(err, StoreError::TargetExists(_)));
    }

    #[test]
    fn capacity_is_enforced() {
        let (driver, _tmp) = driver(1024);

        let slot = driver.stage("big.dat", 1000).unwrap();
        fs::write(&slot.path, vec![0u8; 1000]).unwrap();
        driver
            .commit(&slot.path, "big.dat", &checksum_of_bytes(&vec![0u8; 1000]))
            .unwrap();

        assert_eq!(driver.report().unwrap().used, 1000);

        let err = driver.stage("small.dat", 100).unwrap_err();
        assert!(matches!(err, StoreError::NotEnoughSpace { .. }));

        // Usage unchanged by the rejected stage.
        assert_eq!(driver.report().unwrap().used, 1000);
    }

    #[test]
    fn zero_byte_file_is_accepted() {
        let (driver, _tmp) = driver(1024);
        let slot = driver.stage("empty.dat", 0).unwrap();
        fs::write(&slot.path, b"").unwrap();
        let rel = driver
            .commit(&slot.path, "empty.dat", &checksum_of_bytes(b""))
            .unwrap();
        assert_eq!(driver.path_info(&rel).unwrap().size, 0);
    }

    #[test]
    fn directory_payload_commit() {
        let (driver, _tmp) = driver(1 << 20);
        let slot = driver.stage("obs.uv", 6).unwrap();
        fs::create_dir(&slot.path).unwrap();
        fs::write(slot.path.join("visdata"), b"vis").unwrap();
        fs::write(slot.path.join("flags"), b"flg").unwrap();

        let expected = PathInfo::for_path(&slot.path).unwrap().checksum;
        let rel = driver.commit(&slot.path, "obs.uv", &expected).unwrap();

        let info = driver.path_info(&rel).unwrap();
        assert!(info.is_dir);
        assert_eq!(info.size, 6);
        assert!(info.checksum.matches(&expected));
    }

    #[test]
    fn enumerate_reports_committed_entries() {
        let (driver, _tmp) = driver(1 << 20);
        for name in ["b.dat", "a.dat"] {
            let slot = driver.stage(name, 4).unwrap();
            fs::write(&slot.path, b"data").unwrap();
            driver
                .commit(&slot.path, name, &checksum_of_bytes(b"data"))
                .unwrap();
        }

        let entries = driver.enumerate().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].relative_path, "a.dat");
        assert_eq!(entries[1].relative_path, "b.dat");
        assert!(entries
            .iter()
            .all(|e| e.checksum.matches(&checksum_of_bytes(b"data"))));
    }

    #[test]
    fn unstage_releases_slot() {
        let (driver, _tmp) = driver(1 << 20);
        let slot = driver.stage("x.dat", 1).unwrap();
        fs::write(&slot.path, b"x").unwrap();
        driver.unstage(&slot.dir).unwrap();
        assert!(!slot.dir.exists());
        // Unstaging twice is fine.
        driver.unstage(&slot.dir).unwrap();
    }
}
