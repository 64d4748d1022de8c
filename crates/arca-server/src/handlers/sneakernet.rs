//! SneakerNet: ingest a physically shipped store from its manifest.
//! The bytes are already on the mounted store; ingestion verifies each
//! item in place and records the metadata rows.

use axum::extract::State;
use axum::{Extension, Json};

use arca_core::models::{log_error, DeletionPolicy, File, Instance, Librarian, StoreRow};
use arca_protocol::clone::{CloneCompleteRequest, CloneCompleteResponse};
use arca_protocol::errors::{ErrorCategory, ErrorSeverity};
use arca_protocol::manifest::{
    IngestManifestRequest, IngestManifestResponse, ManifestItem, RejectedManifestItem,
};
use arca_protocol::AuthLevel;

use crate::auth::{require, AuthUser};
use crate::error::ApiError;
use crate::state::ServerState;

enum ItemOutcome {
    Ingested,
    AlreadyPresent,
    Rejected(String),
}

fn ingest_item(
    state: &ServerState,
    store: &StoreRow,
    item: &ManifestItem,
) -> Result<ItemOutcome, arca_core::CoreError> {
    let driver = store.driver()?;

    let existing = state.ctx.with_db(|c| File::get(c, &item.name))?;
    if let Some(existing) = existing {
        if !existing.checksum.matches(&item.checksum) {
            return Ok(ItemOutcome::Rejected(
                "name exists with a different checksum".to_string(),
            ));
        }
        let instance = state.ctx.with_db(|c| Instance::find(c, &item.name, store.id))?;
        if instance.is_some() {
            return Ok(ItemOutcome::AlreadyPresent);
        }
    }

    // The bytes are already in place; verify them where they sit.
    let info = match driver.path_info(&item.relative_path) {
        Ok(info) => info,
        Err(e) => return Ok(ItemOutcome::Rejected(format!("unreadable on store: {e}"))),
    };
    if !info.checksum.matches(&item.checksum) {
        return Ok(ItemOutcome::Rejected(format!(
            "checksum mismatch: manifest {}, on-disk {}",
            item.checksum, info.checksum
        )));
    }
    if info.size != item.size {
        return Ok(ItemOutcome::Rejected(format!(
            "size mismatch: manifest {}, on-disk {}",
            item.size, info.size
        )));
    }

    state.ctx.transaction(|tx| {
        if File::get(tx, &item.name)?.is_none() {
            File::create(
                tx,
                &item.name,
                item.size,
                &item.checksum,
                "sneakernet",
                &state.config.name,
            )?;
        }
        Instance::create(
            tx,
            &item.name,
            store.id,
            &item.relative_path,
            DeletionPolicy::Disallowed,
        )?;
        Ok(())
    })?;
    Ok(ItemOutcome::Ingested)
}

/// Completion callbacks for manifest items that carried an outgoing
/// transfer id, so the shipping side converges without a hypervisor pass.
fn deliver_callbacks(state: &ServerState, source: &str, store_name: &str, items: &[&ManifestItem]) {
    let librarian = match state.ctx.with_db(|c| Librarian::get_by_name(c, source)) {
        Ok(Some(librarian)) => librarian,
        _ => {
            tracing::info!(source, "manifest source not registered; skipping callbacks");
            return;
        }
    };
    let Ok(client) = librarian.client(&state.ctx.keys) else {
        return;
    };
    for item in items {
        let Some(outgoing_id) = item.outgoing_transfer_id else {
            continue;
        };
        let request = CloneCompleteRequest {
            source_transfer_id: outgoing_id,
            destination_transfer_id: -1,
            store_name: store_name.to_string(),
            instance_path: item.relative_path.clone(),
        };
        if let Err(e) = client.post::<_, CloneCompleteResponse>("clone/complete", &request) {
            tracing::warn!(
                item = %item.name,
                error = %e,
                "sneakernet completion callback failed"
            );
        }
    }
}

/// `POST /api/v2/sneakernet/ingest` — READAPPEND.
pub async fn ingest_manifest(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<IngestManifestRequest>,
) -> Result<Json<IngestManifestResponse>, ApiError> {
    require(&user, AuthLevel::ReadAppend)?;

    request
        .manifest
        .validate()
        .map_err(ApiError::BadRequest)?;

    let store = state
        .ctx
        .with_db(|c| StoreRow::get_by_name(c, &request.store_name))
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("no store named '{}'", request.store_name)))?;

    let state_for_task = state.clone();
    let manifest = request.manifest;
    let (response, callback_items) = tokio::task::spawn_blocking(move || {
        let mut ingested = Vec::new();
        let mut rejected = Vec::new();
        let mut callback_items: Vec<usize> = Vec::new();

        for (index, item) in manifest.items.iter().enumerate() {
            match ingest_item(&state_for_task, &store, item) {
                Ok(ItemOutcome::Ingested) => {
                    ingested.push(item.name.clone());
                    callback_items.push(index);
                }
                Ok(ItemOutcome::AlreadyPresent) => ingested.push(item.name.clone()),
                Ok(ItemOutcome::Rejected(reason)) => {
                    let _ = state_for_task.ctx.with_db(|c| {
                        log_error(
                            c,
                            ErrorSeverity::Error,
                            ErrorCategory::Store,
                            &format!("sneakernet item '{}' rejected: {reason}", item.name),
                        )
                    });
                    rejected.push(RejectedManifestItem {
                        name: item.name.clone(),
                        reason,
                    });
                }
                Err(e) => rejected.push(RejectedManifestItem {
                    name: item.name.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        let selected: Vec<&ManifestItem> =
            callback_items.iter().map(|&i| &manifest.items[i]).collect();
        deliver_callbacks(
            &state_for_task,
            &manifest.source_librarian,
            &store.name,
            &selected,
        );

        (
            IngestManifestResponse { ingested, rejected },
            callback_items.len(),
        )
    })
    .await
    .map_err(|e| ApiError::Internal(format!("ingest task panicked: {e}")))?;

    tracing::info!(
        ingested = response.ingested.len(),
        rejected = response.rejected.len(),
        callbacks = callback_items,
        "sneakernet manifest processed"
    );
    Ok(Json(response))
}
