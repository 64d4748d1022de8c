//! Background tasks and their declarative configuration.
//!
//! The worker reads a JSON document mapping task type → list of task
//! configs; each config carries a name, a cadence, a soft timeout, and
//! task-specific parameters. Tasks are straight-line procedures that check
//! their soft timeout between files and never abort mid-file.

pub mod check_integrity;
pub mod create_clone;
pub mod hypervisor;
pub mod queues;
pub mod receive_clone;
pub mod send_clone;

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::context::CoreContext;
use crate::error::{CoreError, Result};
use crate::models::DeletionPolicy;

pub use check_integrity::CheckIntegrity;
pub use create_clone::CreateLocalClone;
pub use hypervisor::{IncomingTransferHypervisor, OutgoingTransferHypervisor};
pub use queues::{CheckConsumedQueue, ConsumeQueue};
pub use receive_clone::ReceiveClone;
pub use send_clone::SendClone;

/// A periodic unit of background work. Infrastructure errors are caught at
/// the task boundary by the scheduler; `run` returning `Err` means the
/// whole tick failed and will be retried on the next cadence.
pub trait BackgroundTask: Send {
    fn name(&self) -> &str;
    fn run(&self, ctx: &CoreContext) -> Result<()>;
}

/// Soft timeout guard. Checked between files; the current file is always
/// finished.
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    pub fn after(soft_timeout: Duration) -> Self {
        Self {
            end: Instant::now() + soft_timeout,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }
}

fn default_soft_timeout_seconds() -> u64 {
    300
}

fn default_files_per_run() -> usize {
    256
}

fn default_send_batch_size() -> usize {
    128
}

fn default_max_live_handles() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckIntegrityConfig {
    pub task_name: String,
    pub every_seconds: u64,
    #[serde(default = "default_soft_timeout_seconds")]
    pub soft_timeout_seconds: u64,
    pub age_in_days: i64,
    pub store: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateLocalCloneConfig {
    pub task_name: String,
    pub every_seconds: u64,
    #[serde(default = "default_soft_timeout_seconds")]
    pub soft_timeout_seconds: u64,
    pub clone_from: String,
    pub clone_to: Vec<String>,
    #[serde(default = "default_files_per_run")]
    pub files_per_run: usize,
    pub age_in_days: i64,
    #[serde(default)]
    pub disable_store_on_full: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendCloneConfig {
    pub task_name: String,
    pub every_seconds: u64,
    #[serde(default = "default_soft_timeout_seconds")]
    pub soft_timeout_seconds: u64,
    pub destination_librarian: String,
    pub age_in_days: i64,
    #[serde(default)]
    pub store_preference: Option<String>,
    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumeQueueConfig {
    pub task_name: String,
    pub every_seconds: u64,
    #[serde(default = "default_soft_timeout_seconds")]
    pub soft_timeout_seconds: u64,
    #[serde(default = "default_max_live_handles")]
    pub max_live_handles: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckConsumedQueueConfig {
    pub task_name: String,
    pub every_seconds: u64,
    #[serde(default = "default_soft_timeout_seconds")]
    pub soft_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiveCloneConfig {
    pub task_name: String,
    pub every_seconds: u64,
    #[serde(default = "default_soft_timeout_seconds")]
    pub soft_timeout_seconds: u64,
    /// "ALLOWED" or "DISALLOWED"; applied to received instances.
    #[serde(default)]
    pub deletion_policy: Option<String>,
    #[serde(default = "default_files_per_run")]
    pub files_per_run: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorConfig {
    pub task_name: String,
    pub every_seconds: u64,
    #[serde(default = "default_soft_timeout_seconds")]
    pub soft_timeout_seconds: u64,
    pub age_in_days: i64,
    /// Transport handles older than this are force-failed and cancelled
    /// (outgoing hypervisor only).
    #[serde(default)]
    pub handle_max_age_in_days: Option<i64>,
}

/// The whole background configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default)]
    pub check_integrity: Vec<CheckIntegrityConfig>,
    #[serde(default)]
    pub create_local_clone: Vec<CreateLocalCloneConfig>,
    #[serde(default)]
    pub send_clone: Vec<SendCloneConfig>,
    #[serde(default)]
    pub consume_queue: Vec<ConsumeQueueConfig>,
    #[serde(default)]
    pub check_consumed_queue: Vec<CheckConsumedQueueConfig>,
    #[serde(default)]
    pub receive_clone: Vec<ReceiveCloneConfig>,
    #[serde(default)]
    pub outgoing_transfer_hypervisor: Vec<HypervisorConfig>,
    #[serde(default)]
    pub incoming_transfer_hypervisor: Vec<HypervisorConfig>,
}

/// A task plus its cadence, ready for the scheduler.
pub struct ScheduledTask {
    pub every: Duration,
    pub task: Box<dyn BackgroundTask>,
}

impl BackgroundConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("read background config '{}': {e}", path.display()))
        })?;
        let config: BackgroundConfig = serde_json::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("parse background config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// The source side must try to repair first: every outgoing
    /// hypervisor's age must be at most every incoming hypervisor's.
    pub fn validate(&self) -> Result<()> {
        let max_outgoing = self
            .outgoing_transfer_hypervisor
            .iter()
            .map(|c| c.age_in_days)
            .max();
        let min_incoming = self
            .incoming_transfer_hypervisor
            .iter()
            .map(|c| c.age_in_days)
            .min();
        if let (Some(outgoing), Some(incoming)) = (max_outgoing, min_incoming) {
            if outgoing > incoming {
                return Err(CoreError::Config(format!(
                    "outgoing_transfer_hypervisor age_in_days ({outgoing}) must not exceed \
                     incoming_transfer_hypervisor age_in_days ({incoming})"
                )));
            }
        }
        for config in &self.receive_clone {
            if let Some(policy) = &config.deletion_policy {
                if DeletionPolicy::from_str_opt(policy).is_none() {
                    return Err(CoreError::Config(format!(
                        "receive_clone '{}': unknown deletion_policy '{policy}'",
                        config.task_name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn into_tasks(self) -> Vec<ScheduledTask> {
        let mut out: Vec<ScheduledTask> = Vec::new();

        for c in self.check_integrity {
            out.push(ScheduledTask {
                every: Duration::from_secs(c.every_seconds),
                task: Box::new(CheckIntegrity::from_config(c)),
            });
        }
        for c in self.create_local_clone {
            out.push(ScheduledTask {
                every: Duration::from_secs(c.every_seconds),
                task: Box::new(CreateLocalClone::from_config(c)),
            });
        }
        for c in self.send_clone {
            out.push(ScheduledTask {
                every: Duration::from_secs(c.every_seconds),
                task: Box::new(SendClone::from_config(c)),
            });
        }
        for c in self.consume_queue {
            out.push(ScheduledTask {
                every: Duration::from_secs(c.every_seconds),
                task: Box::new(ConsumeQueue::from_config(c)),
            });
        }
        for c in self.check_consumed_queue {
            out.push(ScheduledTask {
                every: Duration::from_secs(c.every_seconds),
                task: Box::new(CheckConsumedQueue::from_config(c)),
            });
        }
        for c in self.receive_clone {
            out.push(ScheduledTask {
                every: Duration::from_secs(c.every_seconds),
                task: Box::new(ReceiveClone::from_config(c)),
            });
        }
        for c in self.outgoing_transfer_hypervisor {
            out.push(ScheduledTask {
                every: Duration::from_secs(c.every_seconds),
                task: Box::new(OutgoingTransferHypervisor::from_config(c)),
            });
        }
        for c in self.incoming_transfer_hypervisor {
            out.push(ScheduledTask {
                every: Duration::from_secs(c.every_seconds),
                task: Box::new(IncomingTransferHypervisor::from_config(c)),
            });
        }
        out
    }
}
