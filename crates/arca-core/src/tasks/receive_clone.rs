//! Ingest staged incoming transfers and call back the source.

use std::path::Path;

use arca_protocol::clone::{CloneCompleteRequest, CloneCompleteResponse};
use arca_protocol::errors::{ErrorCategory, ErrorSeverity};
use arca_protocol::TransferStatus;

use crate::context::CoreContext;
use crate::error::{CoreError, Result};
use crate::ingest::ingest_staged_file;
use crate::models::{log_error, DeletionPolicy, IncomingTransfer, Librarian, StoreRow};
use crate::tasks::{BackgroundTask, Deadline, ReceiveCloneConfig};

pub struct ReceiveClone {
    config: ReceiveCloneConfig,
    deletion_policy: DeletionPolicy,
}

impl ReceiveClone {
    pub fn from_config(config: ReceiveCloneConfig) -> Self {
        let deletion_policy = config
            .deletion_policy
            .as_deref()
            .and_then(DeletionPolicy::from_str_opt)
            .unwrap_or(DeletionPolicy::Disallowed);
        Self {
            config,
            deletion_policy,
        }
    }

    fn ingest_one(&self, ctx: &CoreContext, transfer: &mut IncomingTransfer) -> Result<()> {
        let Some(store_id) = transfer.store_id else {
            return ctx.with_db(|c| transfer.fail(c, "staged transfer has no store"));
        };
        let Some(staging_path) = transfer.staging_path.clone() else {
            return ctx.with_db(|c| transfer.fail(c, "staged transfer has no staging path"));
        };
        let Some(store) = ctx.with_db(|c| StoreRow::get(c, store_id))? else {
            return ctx.with_db(|c| transfer.fail(c, "store vanished before ingest"));
        };

        ctx.with_db(|c| transfer.advance(c, TransferStatus::Ingesting))?;

        let staged = Path::new(&staging_path);
        let outcome = ctx.transaction(|tx| {
            ingest_staged_file(
                tx,
                &store,
                staged,
                &transfer.upload_name,
                transfer.transfer_size,
                &transfer.transfer_checksum,
                &transfer.uploader,
                &transfer.source,
                self.deletion_policy,
            )
        });

        match outcome {
            Ok(outcome) => {
                ctx.with_db(|c| {
                    transfer.record_store_path(c, &outcome.instance_path)?;
                    transfer.advance(c, TransferStatus::Completed)?;
                    Ok(())
                })?;
                self.callback(ctx, transfer, &store.name, &outcome.instance_path);
                Ok(())
            }
            Err(e) => {
                let reason = format!("ingest failed: {e}");
                ctx.with_db(|c| {
                    transfer.fail(c, &reason)?;
                    let severity = match &e {
                        CoreError::FileConflict(_) => ErrorSeverity::Critical,
                        _ => ErrorSeverity::Error,
                    };
                    log_error(
                        c,
                        severity,
                        ErrorCategory::Store,
                        &format!(
                            "incoming transfer {} ({}) from {}: {reason}",
                            transfer.id, transfer.upload_name, transfer.source
                        ),
                    )?;
                    Ok(())
                })?;
                // Release the staged bytes; the commit never happened.
                if let Ok(driver) = store.driver() {
                    if let Some(dir) = staged.parent() {
                        let _ = driver.unstage(dir);
                    }
                }
                Ok(())
            }
        }
    }

    /// Completion callback to the source. A lost callback is repaired
    /// later by the source's hypervisor, so failures only log.
    fn callback(
        &self,
        ctx: &CoreContext,
        transfer: &IncomingTransfer,
        store_name: &str,
        instance_path: &str,
    ) {
        let librarian = match ctx.with_db(|c| Librarian::get_by_name(c, &transfer.source)) {
            Ok(Some(librarian)) => librarian,
            _ => {
                tracing::warn!(
                    source = %transfer.source,
                    transfer = transfer.id,
                    "source librarian not registered; cannot deliver completion callback"
                );
                return;
            }
        };
        let Some(source_transfer_id) = transfer.source_transfer_id else {
            return;
        };

        let request = CloneCompleteRequest {
            source_transfer_id,
            destination_transfer_id: transfer.id,
            store_name: store_name.to_string(),
            instance_path: instance_path.to_string(),
        };

        let result = librarian
            .client(&ctx.keys)
            .and_then(|client| {
                client
                    .post::<_, CloneCompleteResponse>("clone/complete", &request)
                    .map_err(CoreError::from)
            });
        if let Err(e) = result {
            let _ = ctx.with_db(|c| {
                log_error(
                    c,
                    ErrorSeverity::Warning,
                    ErrorCategory::Transport,
                    &format!(
                        "completion callback for transfer {} to {} failed: {e}",
                        transfer.id, transfer.source
                    ),
                )
            });
        } else {
            let _ = ctx.with_db(|c| librarian.record_seen(c));
        }
    }
}

impl BackgroundTask for ReceiveClone {
    fn name(&self) -> &str {
        &self.config.task_name
    }

    fn run(&self, ctx: &CoreContext) -> Result<()> {
        let deadline = Deadline::after(std::time::Duration::from_secs(
            self.config.soft_timeout_seconds,
        ));

        let staged = ctx.with_db(|c| {
            IncomingTransfer::with_status(c, TransferStatus::Staged, self.config.files_per_run)
        })?;

        for mut transfer in staged {
            if deadline.expired() {
                return Ok(());
            }
            self.ingest_one(ctx, &mut transfer)?;
        }
        Ok(())
    }
}
