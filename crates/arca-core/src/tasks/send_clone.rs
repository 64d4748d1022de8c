//! Send clones of files to a remote librarian.
//!
//! Selects files lacking both a RemoteInstance at the destination and a
//! live OutgoingTransfer to it, stages a batch of slots on the peer, and
//! enqueues one send-queue item per source store for the queue consumer.

use std::collections::BTreeMap;

use rand::Rng;

use arca_protocol::clone::{CloneBatchStageRequest, CloneBatchStageResponse, CloneFileStanza};
use arca_protocol::errors::{ErrorCategory, ErrorSeverity};

use crate::context::CoreContext;
use crate::error::{CoreError, Result};
use crate::models::{log_error, File, Instance, Librarian, OutgoingTransfer, SendQueueItem, StoreRow};
use crate::tasks::{BackgroundTask, Deadline, SendCloneConfig};

pub struct SendClone {
    config: SendCloneConfig,
}

impl SendClone {
    pub fn from_config(config: SendCloneConfig) -> Self {
        Self { config }
    }

    /// Pick the instance to send: any available one, preferring the
    /// configured store.
    fn choose_instance(
        &self,
        ctx: &CoreContext,
        file: &File,
    ) -> Result<Option<(Instance, StoreRow)>> {
        ctx.with_db(|conn| {
            let mut chosen: Option<(Instance, StoreRow)> = None;
            for instance in Instance::for_file(conn, &file.name)? {
                if !instance.available {
                    continue;
                }
                let Some(store) = StoreRow::get(conn, instance.store_id)? else {
                    continue;
                };
                let preferred = self.config.store_preference.as_deref() == Some(store.name.as_str());
                let replace = chosen.is_none() || preferred;
                if replace {
                    chosen = Some((instance, store));
                    if preferred {
                        break;
                    }
                }
            }
            Ok(chosen)
        })
    }
}

impl BackgroundTask for SendClone {
    fn name(&self) -> &str {
        &self.config.task_name
    }

    fn run(&self, ctx: &CoreContext) -> Result<()> {
        let destination = &self.config.destination_librarian;
        let Some(librarian) = ctx.with_db(|c| Librarian::get_by_name(c, destination))? else {
            return Err(CoreError::LibrarianNotFound(destination.clone()));
        };
        if !librarian.transfers_enabled {
            tracing::debug!(peer = %librarian.name, "transfers disabled, skipping send cycle");
            return Ok(());
        }

        let client = librarian.client(&ctx.keys)?;
        if let Err(e) = client.ping_checked(&librarian.name) {
            ctx.with_db(|c| {
                librarian.record_error(c, &e.to_string())?;
                log_error(
                    c,
                    ErrorSeverity::Error,
                    ErrorCategory::Peer,
                    &format!("librarian {} unreachable for send cycle: {e}", librarian.name),
                )?;
                Ok(())
            })?;
            return Ok(());
        }
        ctx.with_db(|c| librarian.record_seen(c))?;

        let files = ctx.with_db(|c| {
            File::needing_clone_to(
                c,
                destination,
                self.config.age_in_days,
                self.config.send_batch_size,
            )
        })?;
        if files.is_empty() {
            return Ok(());
        }

        let deadline = Deadline::after(std::time::Duration::from_secs(
            self.config.soft_timeout_seconds,
        ));

        // Create the outgoing transfers first; their ids are the
        // idempotency keys the peer records.
        let mut transfers: Vec<OutgoingTransfer> = Vec::new();
        let mut stanzas: Vec<CloneFileStanza> = Vec::new();
        for file in &files {
            if deadline.expired() {
                break;
            }
            let Some((instance, store)) = self.choose_instance(ctx, file)? else {
                tracing::warn!(file = %file.name, "no available instance to send, skipping");
                continue;
            };
            let source_path = store.driver()?.resolve(&instance.path)?;
            let transfer = ctx.with_db(|c| {
                OutgoingTransfer::new_transfer(
                    c,
                    destination,
                    &file.name,
                    instance.id,
                    store.id,
                    file.size,
                    &file.checksum,
                    &source_path.display().to_string(),
                )
            })?;
            stanzas.push(CloneFileStanza {
                name: file.name.clone(),
                size: file.size,
                checksum: file.checksum.clone(),
                uploader: file.uploader.clone(),
                source_transfer_id: transfer.id,
            });
            transfers.push(transfer);
        }
        if transfers.is_empty() {
            return Ok(());
        }

        let batch_id = format!("{:016x}", rand::thread_rng().gen::<u64>());
        let request = CloneBatchStageRequest {
            batch_id: batch_id.clone(),
            source: ctx.site_name.clone(),
            files: stanzas,
        };

        let response: CloneBatchStageResponse = match client.post("clone/stage_batch", &request) {
            Ok(response) => response,
            Err(e) => {
                let reason = format!("stage_batch on {} failed: {e}", librarian.name);
                ctx.with_db(|c| {
                    for transfer in &mut transfers {
                        transfer.fail(c, &reason)?;
                    }
                    log_error(c, ErrorSeverity::Warning, ErrorCategory::Transport, &reason)?;
                    Ok(())
                })?;
                return Ok(());
            }
        };

        // Record the peer's staging slots against our transfers.
        let by_source_id: BTreeMap<i64, &arca_protocol::clone::CloneStagedStanza> = response
            .stanzas
            .iter()
            .map(|s| (s.source_transfer_id, s))
            .collect();

        ctx.with_db(|c| {
            for transfer in &mut transfers {
                match by_source_id.get(&transfer.id) {
                    Some(stanza) => {
                        transfer.record_staging(
                            c,
                            stanza.destination_transfer_id,
                            &stanza.staging_path,
                            &batch_id,
                        )?;
                    }
                    None => {
                        let reason = response
                            .rejected
                            .get(&transfer.id)
                            .map(|r| format!("peer rejected stage: {r}"))
                            .unwrap_or_else(|| "peer did not allocate a staging slot".to_string());
                        transfer.fail(c, &reason)?;
                    }
                }
            }
            Ok(())
        })?;

        // One queue item per source store; the async manager is a
        // per-store concern.
        let mut by_store: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (index, transfer) in transfers.iter().enumerate() {
            if transfer.status == arca_protocol::TransferStatus::Initiated {
                if let Some(store_id) = transfer.store_id {
                    by_store.entry(store_id).or_default().push(index);
                }
            }
        }

        for (store_id, indices) in by_store {
            let store = ctx
                .with_db(|c| StoreRow::get(c, store_id))?
                .ok_or(CoreError::StoreNotFound(store_id.to_string()))?;
            let (manager_name, _) = store.async_transfer_manager()?;

            if !response.accepted_async_managers.is_empty()
                && !response.accepted_async_managers.contains(&manager_name)
            {
                let reason = format!(
                    "peer {} does not accept async manager '{manager_name}'",
                    librarian.name
                );
                ctx.with_db(|c| {
                    for &index in &indices {
                        transfers[index].fail(c, &reason)?;
                    }
                    log_error(c, ErrorSeverity::Warning, ErrorCategory::Transport, &reason)?;
                    Ok(())
                })?;
                continue;
            }

            ctx.with_db(|c| {
                let item = SendQueueItem::new_item(
                    c,
                    0,
                    destination,
                    &response.destination_endpoint,
                    &manager_name,
                )?;
                for &index in &indices {
                    transfers[index].assign_queue(c, item.id, &manager_name)?;
                }
                tracing::info!(
                    queue_item = item.id,
                    batch = %batch_id,
                    files = indices.len(),
                    peer = %destination,
                    "enqueued clone batch"
                );
                Ok(())
            })?;
        }

        Ok(())
    }
}
