//! Send-queue consumers: hand queued batches to the async transport, and
//! poll live transport handles to completion.

use std::path::PathBuf;

use arca_protocol::checkin::{CheckinUpdateRequest, CheckinUpdateResponse};
use arca_protocol::clone::{CloneFailRequest, CloneFailResponse};
use arca_protocol::errors::{ErrorCategory, ErrorSeverity};
use arca_protocol::TransferStatus;
use arca_store::async_transfer::AsyncTransferStatus;

use crate::context::CoreContext;
use crate::error::Result;
use crate::models::send_queue::MAX_SUBMIT_RETRIES;
use crate::models::{log_error, Librarian, OutgoingTransfer, SendQueueItem, StoreRow};
use crate::tasks::{
    BackgroundTask, CheckConsumedQueueConfig, ConsumeQueueConfig, Deadline,
};

pub struct ConsumeQueue {
    config: ConsumeQueueConfig,
}

impl ConsumeQueue {
    pub fn from_config(config: ConsumeQueueConfig) -> Self {
        Self { config }
    }
}

fn transfer_pairs(transfers: &[OutgoingTransfer]) -> Option<Vec<(PathBuf, PathBuf)>> {
    transfers
        .iter()
        .map(|t| {
            Some((
                PathBuf::from(t.source_path.as_deref()?),
                PathBuf::from(t.dest_path.as_deref()?),
            ))
        })
        .collect()
}

impl BackgroundTask for ConsumeQueue {
    fn name(&self) -> &str {
        &self.config.task_name
    }

    fn run(&self, ctx: &CoreContext) -> Result<()> {
        let deadline = Deadline::after(std::time::Duration::from_secs(
            self.config.soft_timeout_seconds,
        ));

        loop {
            if deadline.expired() {
                return Ok(());
            }

            let live = ctx.with_db(|c| SendQueueItem::live_handle_count(c))?;
            if live >= self.config.max_live_handles {
                tracing::debug!(live, cap = self.config.max_live_handles, "handle cap reached");
                return Ok(());
            }

            let Some(mut item) = ctx.with_db(|c| SendQueueItem::next_queued(c))? else {
                return Ok(());
            };

            let transfers = ctx.with_db(|c| OutgoingTransfer::by_send_queue(c, item.id))?;
            let live_transfers: Vec<OutgoingTransfer> = transfers
                .into_iter()
                .filter(|t| t.status == TransferStatus::Initiated)
                .collect();
            if live_transfers.is_empty() {
                ctx.with_db(|c| item.mark_completed(c, false))?;
                continue;
            }

            let Some(pairs) = transfer_pairs(&live_transfers) else {
                ctx.with_db(|c| {
                    let mut transfers = live_transfers;
                    for t in &mut transfers {
                        t.fail(c, "queue item missing source or destination path")?;
                    }
                    item.mark_completed(c, true)?;
                    log_error(
                        c,
                        ErrorSeverity::Error,
                        ErrorCategory::Internal,
                        &format!("send queue item {} had incomplete path data", item.id),
                    )?;
                    Ok(())
                })?;
                continue;
            };

            let store_id = live_transfers[0].store_id.unwrap_or_default();
            let manager = match ctx
                .with_db(|c| StoreRow::get(c, store_id))?
                .ok_or_else(|| crate::error::CoreError::StoreNotFound(store_id.to_string()))
                .and_then(|store| item_manager(&store, &item))
            {
                Ok(manager) => manager,
                Err(e) => {
                    ctx.with_db(|c| {
                        let mut transfers = live_transfers;
                        for t in &mut transfers {
                            t.fail(c, &e.to_string())?;
                        }
                        item.mark_completed(c, true)?;
                        log_error(
                            c,
                            ErrorSeverity::Error,
                            ErrorCategory::Configuration,
                            &format!("send queue item {}: {e}", item.id),
                        )?;
                        Ok(())
                    })?;
                    continue;
                }
            };

            // The submit call happens outside any database lock.
            match manager.submit(&pairs, &item.destination_endpoint) {
                Ok(handle) => {
                    ctx.with_db(|c| {
                        item.mark_consumed(c, &handle)?;
                        let mut transfers = live_transfers;
                        for t in &mut transfers {
                            t.advance(c, TransferStatus::Ongoing)?;
                        }
                        Ok(())
                    })?;
                    tracing::info!(queue_item = item.id, "submitted batch to transport");
                }
                Err(e) => {
                    ctx.with_db(|c| {
                        item.record_retry(c)?;
                        if item.retries >= MAX_SUBMIT_RETRIES {
                            let reason = format!("transport submit failed: {e}");
                            let mut transfers = live_transfers;
                            for t in &mut transfers {
                                t.fail(c, &reason)?;
                                log_error(
                                    c,
                                    ErrorSeverity::Warning,
                                    ErrorCategory::Transport,
                                    &format!("transfer {} of {}: {reason}", t.id, t.file_name),
                                )?;
                            }
                            item.mark_completed(c, true)?;
                        }
                        Ok(())
                    })?;
                    return Ok(());
                }
            }
        }
    }
}

fn item_manager(
    store: &StoreRow,
    item: &SendQueueItem,
) -> Result<Box<dyn arca_store::async_transfer::AsyncTransferManager>> {
    store.async_transfer_manager_named(&item.async_manager_name)
}

pub struct CheckConsumedQueue {
    config: CheckConsumedQueueConfig,
}

impl CheckConsumedQueue {
    pub fn from_config(config: CheckConsumedQueueConfig) -> Self {
        Self { config }
    }

    /// Tell the destination its incoming transfers are staged, then mirror
    /// the state locally. Nothing local changes unless the peer confirmed.
    fn confirm_staged(
        &self,
        ctx: &CoreContext,
        item: &mut SendQueueItem,
        transfers: &mut [OutgoingTransfer],
    ) -> Result<()> {
        let Some(librarian) = ctx.with_db(|c| Librarian::get_by_name(c, &item.destination))?
        else {
            ctx.with_db(|c| {
                log_error(
                    c,
                    ErrorSeverity::Error,
                    ErrorCategory::Configuration,
                    &format!(
                        "send queue item {}: destination librarian '{}' not registered",
                        item.id, item.destination
                    ),
                )
            })?;
            return Ok(());
        };

        let destination_transfer_ids: Vec<i64> = transfers
            .iter()
            .filter_map(|t| t.remote_transfer_id)
            .collect();
        let request = CheckinUpdateRequest {
            destination_transfer_ids,
            new_status: TransferStatus::Staged,
        };

        let client = librarian.client(&ctx.keys)?;
        match client.post::<_, CheckinUpdateResponse>("checkin/update", &request) {
            Ok(_) => ctx.with_db(|c| {
                for t in transfers.iter_mut() {
                    t.advance(c, TransferStatus::Staged)?;
                }
                item.mark_completed(c, false)?;
                librarian.record_seen(c)?;
                Ok(())
            }),
            Err(e) => ctx.with_db(|c| {
                // Leave the item live; the next tick (or the hypervisor)
                // retries the confirmation.
                librarian.record_error(c, &e.to_string())?;
                log_error(
                    c,
                    ErrorSeverity::Warning,
                    ErrorCategory::Transport,
                    &format!(
                        "could not confirm staged batch {} with {}: {e}",
                        item.id, item.destination
                    ),
                )?;
                Ok(())
            }),
        }
    }

    fn fail_batch(
        &self,
        ctx: &CoreContext,
        item: &mut SendQueueItem,
        transfers: &mut [OutgoingTransfer],
        reason: &str,
    ) -> Result<()> {
        ctx.with_db(|c| {
            for t in transfers.iter_mut() {
                t.fail(c, reason)?;
                log_error(
                    c,
                    ErrorSeverity::Warning,
                    ErrorCategory::Transport,
                    &format!("transfer {} of {} failed: {reason}", t.id, t.file_name),
                )?;
            }
            item.mark_completed(c, true)?;
            Ok(())
        })?;

        // Best effort: ask the peer to fail its incoming halves too.
        if let Some(librarian) =
            ctx.with_db(|c| Librarian::get_by_name(c, &item.destination))?
        {
            if let Ok(client) = librarian.client(&ctx.keys) {
                for t in transfers.iter() {
                    let Some(remote_id) = t.remote_transfer_id else {
                        continue;
                    };
                    let request = CloneFailRequest {
                        destination_transfer_id: remote_id,
                        source_transfer_id: t.id,
                        reason: reason.to_string(),
                    };
                    if let Err(e) = client.post::<_, CloneFailResponse>("clone/fail", &request) {
                        tracing::warn!(
                            transfer = t.id,
                            peer = %item.destination,
                            error = %e,
                            "could not propagate failure to peer"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

impl BackgroundTask for CheckConsumedQueue {
    fn name(&self) -> &str {
        &self.config.task_name
    }

    fn run(&self, ctx: &CoreContext) -> Result<()> {
        let deadline = Deadline::after(std::time::Duration::from_secs(
            self.config.soft_timeout_seconds,
        ));

        let items = ctx.with_db(|c| SendQueueItem::consumed_incomplete(c))?;
        for mut item in items {
            if deadline.expired() {
                return Ok(());
            }

            let mut transfers = ctx.with_db(|c| OutgoingTransfer::by_send_queue(c, item.id))?;
            let Some(handle) = item.transfer_handle.clone() else {
                self.fail_batch(ctx, &mut item, &mut transfers, "consumed item lost its handle")?;
                continue;
            };

            let store_id = transfers
                .first()
                .and_then(|t| t.store_id)
                .unwrap_or_default();
            let Some(store) = ctx.with_db(|c| StoreRow::get(c, store_id))? else {
                self.fail_batch(ctx, &mut item, &mut transfers, "source store vanished")?;
                continue;
            };
            let manager = store.async_transfer_manager_named(&item.async_manager_name)?;

            match manager.poll(&handle) {
                AsyncTransferStatus::Active => continue,
                AsyncTransferStatus::Succeeded => {
                    self.confirm_staged(ctx, &mut item, &mut transfers)?;
                }
                AsyncTransferStatus::Failed(reason) => {
                    self.fail_batch(ctx, &mut item, &mut transfers, &reason)?;
                }
                AsyncTransferStatus::Unknown => {
                    ctx.with_db(|c| {
                        log_error(
                            c,
                            ErrorSeverity::Warning,
                            ErrorCategory::Transport,
                            &format!(
                                "transport has no record of handle '{handle}' \
                                 (queue item {}); leaving for the hypervisor",
                                item.id
                            ),
                        )
                    })?;
                }
            }
        }
        Ok(())
    }
}
