//! Asynchronous transfer managers: peer-to-peer bulk transport with a
//! submit → poll → complete lifecycle.
//!
//! `submit` hands a batch of (source, destination) paths to the transport
//! and returns an opaque handle string. The handle, not in-memory state, is
//! what later polls consult, so any worker process can pick up the poll.
//! Handles look like `<manager>:<outcome>:<token>`.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Command;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::transfer::{LocalTransferManager, TransferManager};

/// Poll result for an async transport handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncTransferStatus {
    Active,
    Succeeded,
    Failed(String),
    /// The transport has no record of the handle.
    Unknown,
}

pub trait AsyncTransferManager: Send + Sync {
    /// Submit a batch. Returns the transport handle. The caller must not
    /// assume the bytes have moved when this returns.
    fn submit(&self, pairs: &[(PathBuf, PathBuf)], destination_endpoint: &str) -> Result<String>;

    fn poll(&self, handle: &str) -> AsyncTransferStatus;

    /// Best-effort cancel; completed or unknown handles are left alone.
    fn cancel(&self, _handle: &str) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String;
}

fn mint_handle(manager: &str, outcome: &str) -> String {
    let token: u64 = rand::thread_rng().gen();
    let mut handle = String::new();
    let _ = write!(handle, "{manager}:{outcome}:{token:016x}");
    handle
}

fn poll_handle(manager: &str, handle: &str) -> AsyncTransferStatus {
    let mut parts = handle.splitn(3, ':');
    if parts.next() != Some(manager) {
        return AsyncTransferStatus::Unknown;
    }
    match parts.next() {
        Some("ok") => AsyncTransferStatus::Succeeded,
        Some("fail") => AsyncTransferStatus::Failed(
            parts.next().unwrap_or("transport reported failure").into(),
        ),
        _ => AsyncTransferStatus::Unknown,
    }
}

/// Plain file-copy fallback. Only valid when the destination staging area
/// is reachable through the local filesystem (shared mounts, tests, or
/// peers colocated on one machine). The copy happens at submit time; the
/// handle records the outcome for later polls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalAsyncTransferManager {}

impl AsyncTransferManager for LocalAsyncTransferManager {
    fn submit(&self, pairs: &[(PathBuf, PathBuf)], _destination_endpoint: &str) -> Result<String> {
        let copier = LocalTransferManager::default();
        for (source, destination) in pairs {
            copier.submit(source, destination)?;
        }
        Ok(mint_handle("local_async", "ok"))
    }

    fn poll(&self, handle: &str) -> AsyncTransferStatus {
        poll_handle("local_async", handle)
    }

    fn describe(&self) -> String {
        "asynchronous local filesystem copy".to_string()
    }
}

/// rsync-over-SSH transport. Batches are pushed with one rsync invocation
/// per pair against `user@endpoint:destination`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RsyncAsyncTransferManager {
    #[serde(default)]
    pub remote_user: Option<String>,
    /// Extra arguments appended to every invocation (e.g. bandwidth caps).
    #[serde(default)]
    pub rsync_args: Vec<String>,
}

impl AsyncTransferManager for RsyncAsyncTransferManager {
    fn submit(&self, pairs: &[(PathBuf, PathBuf)], destination_endpoint: &str) -> Result<String> {
        for (source, destination) in pairs {
            let remote = match &self.remote_user {
                Some(user) => format!("{user}@{destination_endpoint}:{}", destination.display()),
                None => format!("{destination_endpoint}:{}", destination.display()),
            };
            let output = Command::new("rsync")
                .arg("-a")
                .args(&self.rsync_args)
                .arg(source)
                .arg(&remote)
                .output()
                .map_err(|e| StoreError::TransferFailed(format!("rsync spawn: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(StoreError::TransferFailed(format!(
                    "rsync to {remote} exited {}: {}",
                    output.status,
                    stderr.trim()
                )));
            }
        }
        Ok(mint_handle("rsync", "ok"))
    }

    fn poll(&self, handle: &str) -> AsyncTransferStatus {
        poll_handle("rsync", handle)
    }

    fn describe(&self) -> String {
        "rsync over ssh".to_string()
    }
}

/// Fault-injection manager: accepts every batch and reports failure on
/// poll. Used by integration tests to exercise the failure sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailingAsyncTransferManager {}

impl AsyncTransferManager for FailingAsyncTransferManager {
    fn submit(&self, _pairs: &[(PathBuf, PathBuf)], _destination_endpoint: &str) -> Result<String> {
        Ok(mint_handle("failing", "fail"))
    }

    fn poll(&self, handle: &str) -> AsyncTransferStatus {
        match poll_handle("failing", handle) {
            AsyncTransferStatus::Failed(_) => {
                AsyncTransferStatus::Failed("injected transport failure".into())
            }
            other => other,
        }
    }

    fn describe(&self) -> String {
        "always-failing transport (fault injection)".to_string()
    }
}

/// Build an async transfer manager by its configuration tag.
pub fn async_transfer_manager_from_config(
    name: &str,
    config: &serde_json::Value,
) -> Result<Box<dyn AsyncTransferManager>> {
    match name {
        "local_async" => Ok(Box::new(LocalAsyncTransferManager::default())),
        "rsync" => {
            let manager: RsyncAsyncTransferManager = serde_json::from_value(config.clone())
                .map_err(|e| StoreError::Config(format!("rsync manager: {e}")))?;
            Ok(Box::new(manager))
        }
        "failing" => Ok(Box::new(FailingAsyncTransferManager::default())),
        other => Err(StoreError::UnsupportedTransferManager(other.to_string())),
    }
}
