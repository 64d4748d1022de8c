//! Reconciliation tasks that sweep stuck transfers and query the peer for
//! ground truth. The source-side sweep runs at a smaller age than the
//! destination-side one, so the source always tries to repair first.

use arca_protocol::checkin::{CheckinStatusRequest, CheckinStatusResponse};
use arca_protocol::clone::{CloneFailRequest, CloneFailResponse};
use arca_protocol::errors::{ErrorCategory, ErrorSeverity};
use arca_protocol::TransferStatus;

use crate::context::CoreContext;
use crate::error::Result;
use crate::models::{
    log_error, IncomingTransfer, Librarian, OutgoingTransfer, RemoteInstance, SendQueueItem,
    StoreRow,
};
use crate::tasks::{BackgroundTask, Deadline, HypervisorConfig};

pub struct OutgoingTransferHypervisor {
    config: HypervisorConfig,
}

impl OutgoingTransferHypervisor {
    pub fn from_config(config: HypervisorConfig) -> Self {
        Self { config }
    }

    /// Force-fail transport handles that have outlived their maximum age,
    /// attempting a cancel on the transport first.
    fn sweep_overdue_handles(&self, ctx: &CoreContext, max_age_in_days: i64) -> Result<()> {
        let overdue = ctx.with_db(|c| SendQueueItem::overdue(c, max_age_in_days))?;
        for mut item in overdue {
            let transfers = ctx.with_db(|c| OutgoingTransfer::by_send_queue(c, item.id))?;
            if let Some(handle) = item.transfer_handle.clone() {
                let store_id = transfers
                    .first()
                    .and_then(|t| t.store_id)
                    .unwrap_or_default();
                if let Some(store) = ctx.with_db(|c| StoreRow::get(c, store_id))? {
                    if let Ok(manager) =
                        store.async_transfer_manager_named(&item.async_manager_name)
                    {
                        let _ = manager.cancel(&handle);
                    }
                }
            }
            ctx.with_db(|c| {
                let mut transfers = transfers;
                for t in &mut transfers {
                    t.fail(c, "transport handle exceeded its maximum age")?;
                }
                item.mark_completed(c, true)?;
                log_error(
                    c,
                    ErrorSeverity::Warning,
                    ErrorCategory::Transport,
                    &format!(
                        "cancelled overdue transport handle for queue item {} (older than {} days)",
                        item.id, max_age_in_days
                    ),
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn reconcile(&self, ctx: &CoreContext, transfer: &mut OutgoingTransfer) -> Result<()> {
        let Some(librarian) =
            ctx.with_db(|c| Librarian::get_by_name(c, &transfer.destination))?
        else {
            return ctx.with_db(|c| {
                transfer.fail(c, "destination librarian no longer registered")?;
                log_error(
                    c,
                    ErrorSeverity::Error,
                    ErrorCategory::Configuration,
                    &format!(
                        "stale transfer {} addressed to unknown librarian '{}'",
                        transfer.id, transfer.destination
                    ),
                )?;
                Ok(())
            });
        };

        let client = librarian.client(&ctx.keys)?;
        let request = CheckinStatusRequest {
            source_transfer_ids: vec![transfer.id],
        };
        let response: CheckinStatusResponse = match client.post("checkin/status", &request) {
            Ok(response) => response,
            Err(e) => {
                // The peer is unreachable; leave the transfer for the next
                // sweep rather than guessing.
                return ctx.with_db(|c| {
                    librarian.record_error(c, &e.to_string())?;
                    log_error(
                        c,
                        ErrorSeverity::Error,
                        ErrorCategory::Peer,
                        &format!(
                            "could not query {} about stale transfer {}: {e}",
                            librarian.name, transfer.id
                        ),
                    )?;
                    Ok(())
                });
            }
        };
        ctx.with_db(|c| librarian.record_seen(c))?;

        let peer_status = response
            .incoming_status
            .get(&transfer.id)
            .map(|report| report.status);

        match (transfer.status, peer_status) {
            // The callback was lost; repair its effects.
            (TransferStatus::Staged, Some(TransferStatus::Completed)) => ctx.with_db(|c| {
                RemoteInstance::create(c, &transfer.file_name, librarian.id, None)?;
                transfer.advance(c, TransferStatus::Completed)?;
                tracing::info!(
                    transfer = transfer.id,
                    file = %transfer.file_name,
                    peer = %librarian.name,
                    "repaired lost completion callback"
                );
                Ok(())
            }),
            // Peer is still working on it.
            (
                TransferStatus::Staged,
                Some(TransferStatus::Staged | TransferStatus::Ingesting),
            ) => ctx.with_db(|c| transfer.extend_deadline(c)),
            // Forward-sync: the peer confirmed staging we never recorded.
            (TransferStatus::Ongoing, Some(TransferStatus::Staged | TransferStatus::Ingesting)) => {
                ctx.with_db(|c| transfer.advance(c, TransferStatus::Staged))
            }
            (TransferStatus::Ongoing, Some(TransferStatus::Completed)) => ctx.with_db(|c| {
                transfer.advance(c, TransferStatus::Staged)?;
                RemoteInstance::create(c, &transfer.file_name, librarian.id, None)?;
                transfer.advance(c, TransferStatus::Completed)?;
                Ok(())
            }),
            // Everything else means the push will never finish.
            (_, peer_status) => {
                let reason = match peer_status {
                    Some(status) => format!("peer reports incoming transfer as {status}"),
                    None => "peer has no record of the transfer".to_string(),
                };
                ctx.with_db(|c| {
                    transfer.fail(c, &reason)?;
                    log_error(
                        c,
                        ErrorSeverity::Warning,
                        ErrorCategory::Transport,
                        &format!("stale transfer {} failed: {reason}", transfer.id),
                    )?;
                    Ok(())
                })?;
                // Ask the peer to drop its half if it still has one.
                if let Some(remote_id) = transfer.remote_transfer_id {
                    if peer_status.is_some_and(|s| !s.is_terminal()) {
                        let request = CloneFailRequest {
                            destination_transfer_id: remote_id,
                            source_transfer_id: transfer.id,
                            reason: "source abandoned the transfer".to_string(),
                        };
                        if let Err(e) =
                            client.post::<_, CloneFailResponse>("clone/fail", &request)
                        {
                            tracing::warn!(
                                transfer = transfer.id,
                                error = %e,
                                "could not propagate abandonment to peer"
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl BackgroundTask for OutgoingTransferHypervisor {
    fn name(&self) -> &str {
        &self.config.task_name
    }

    fn run(&self, ctx: &CoreContext) -> Result<()> {
        let deadline = Deadline::after(std::time::Duration::from_secs(
            self.config.soft_timeout_seconds,
        ));

        if let Some(max_age) = self.config.handle_max_age_in_days {
            self.sweep_overdue_handles(ctx, max_age)?;
        }

        let stale = ctx.with_db(|c| OutgoingTransfer::stale(c, self.config.age_in_days))?;
        for mut transfer in stale {
            if deadline.expired() {
                return Ok(());
            }
            self.reconcile(ctx, &mut transfer)?;
        }
        Ok(())
    }
}

pub struct IncomingTransferHypervisor {
    config: HypervisorConfig,
}

impl IncomingTransferHypervisor {
    pub fn from_config(config: HypervisorConfig) -> Self {
        Self { config }
    }

    fn unstage(&self, ctx: &CoreContext, transfer: &IncomingTransfer) {
        let (Some(store_id), Some(staging_path)) = (transfer.store_id, &transfer.staging_path)
        else {
            return;
        };
        let store = match ctx.with_db(|c| StoreRow::get(c, store_id)) {
            Ok(Some(store)) => store,
            _ => return,
        };
        if let Ok(driver) = store.driver() {
            if let Some(dir) = std::path::Path::new(staging_path).parent() {
                let _ = driver.unstage(dir);
            }
        }
    }

    fn reconcile(&self, ctx: &CoreContext, transfer: &mut IncomingTransfer) -> Result<()> {
        let Some(librarian) = ctx.with_db(|c| Librarian::get_by_name(c, &transfer.source))?
        else {
            ctx.with_db(|c| {
                transfer.fail(c, "source librarian no longer registered")?;
                log_error(
                    c,
                    ErrorSeverity::Error,
                    ErrorCategory::Configuration,
                    &format!(
                        "stale incoming transfer {} from unknown librarian '{}'",
                        transfer.id, transfer.source
                    ),
                )?;
                Ok(())
            })?;
            self.unstage(ctx, transfer);
            return Ok(());
        };

        let Some(source_transfer_id) = transfer.source_transfer_id else {
            ctx.with_db(|c| transfer.fail(c, "incoming transfer has no idempotency key"))?;
            self.unstage(ctx, transfer);
            return Ok(());
        };

        let client = librarian.client(&ctx.keys)?;
        let request = CheckinStatusRequest {
            source_transfer_ids: vec![source_transfer_id],
        };
        let response: CheckinStatusResponse = match client.post("checkin/status", &request) {
            Ok(response) => response,
            Err(e) => {
                return ctx.with_db(|c| {
                    librarian.record_error(c, &e.to_string())?;
                    log_error(
                        c,
                        ErrorSeverity::Error,
                        ErrorCategory::Peer,
                        &format!(
                            "could not query {} about stale incoming transfer {}: {e}",
                            librarian.name, transfer.id
                        ),
                    )?;
                    Ok(())
                });
            }
        };
        ctx.with_db(|c| librarian.record_seen(c))?;

        let source_status = response
            .outgoing_status
            .get(&source_transfer_id)
            .map(|report| report.status);

        match (transfer.status, source_status) {
            // The source gave up or never heard of it: drop our half.
            (_, None)
            | (_, Some(TransferStatus::Failed | TransferStatus::Cancelled)) => {
                let reason = match source_status {
                    Some(status) => format!("source reports outgoing transfer as {status}"),
                    None => "source has no record of the transfer".to_string(),
                };
                ctx.with_db(|c| {
                    transfer.fail(c, &reason)?;
                    log_error(
                        c,
                        ErrorSeverity::Warning,
                        ErrorCategory::Transport,
                        &format!("stale incoming transfer {} failed: {reason}", transfer.id),
                    )?;
                    Ok(())
                })?;
                self.unstage(ctx, transfer);
                Ok(())
            }
            // Source believes it finished while we never ingested: a
            // push-based system cannot reach this; flag for a human.
            (TransferStatus::Initiated, Some(TransferStatus::Completed)) => ctx.with_db(|c| {
                log_error(
                    c,
                    ErrorSeverity::Critical,
                    ErrorCategory::Internal,
                    &format!(
                        "incoming transfer {} is INITIATED locally but COMPLETED at source; \
                         manual check required",
                        transfer.id
                    ),
                )?;
                transfer.fail(c, "inconsistent with source state COMPLETED")?;
                Ok(())
            }),
            // Catch up: the bytes are on disk, the staged confirmation
            // was lost.
            (TransferStatus::Initiated, Some(TransferStatus::Staged)) => {
                ctx.with_db(|c| transfer.advance(c, TransferStatus::Staged))
            }
            // Bytes still en route; the source repairs first.
            (TransferStatus::Initiated, Some(_)) => Ok(()),
            // STAGED transfers belong to the receive worker, not us.
            (TransferStatus::Staged, Some(TransferStatus::Completed)) => ctx.with_db(|c| {
                log_error(
                    c,
                    ErrorSeverity::Critical,
                    ErrorCategory::Internal,
                    &format!(
                        "incoming transfer {} is STAGED locally but already COMPLETED at source; \
                         manual check required",
                        transfer.id
                    ),
                )?;
                Ok(())
            }),
            (TransferStatus::Staged, Some(_)) => Ok(()),
            _ => Ok(()),
        }
    }
}

impl BackgroundTask for IncomingTransferHypervisor {
    fn name(&self) -> &str {
        &self.config.task_name
    }

    fn run(&self, ctx: &CoreContext) -> Result<()> {
        let deadline = Deadline::after(std::time::Duration::from_secs(
            self.config.soft_timeout_seconds,
        ));

        let stale = ctx.with_db(|c| IncomingTransfer::stale(c, self.config.age_in_days))?;
        for mut transfer in stale {
            if deadline.expired() {
                return Ok(());
            }
            self.reconcile(ctx, &mut transfer)?;
        }
        Ok(())
    }
}
