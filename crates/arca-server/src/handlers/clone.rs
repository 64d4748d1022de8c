//! Destination and source halves of the peer-to-peer clone protocol.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::{Extension, Json};

use arca_core::models::{
    log_error, File, IncomingTransfer, Librarian, OutgoingTransfer, RemoteInstance, StoreRow,
};
use arca_protocol::clone::{
    CloneBatchStageRequest, CloneBatchStageResponse, CloneCompleteRequest, CloneCompleteResponse,
    CloneFailRequest, CloneFailResponse, CloneStagedStanza,
};
use arca_protocol::errors::{ErrorCategory, ErrorSeverity};
use arca_protocol::{AuthLevel, TransferStatus};

use crate::auth::{require, AuthUser};
use crate::error::ApiError;
use crate::state::ServerState;

/// Pick the store for an incoming batch: the enabled, reachable store
/// with the most free space that can take the largest file. Clones are
/// welcome on non-ingestible stores.
fn choose_clone_store(state: &ServerState, largest: u64) -> Result<StoreRow, ApiError> {
    let stores = state.ctx.with_db(StoreRow::all).map_err(ApiError::from)?;

    let mut best: Option<(u64, StoreRow)> = None;
    for store in stores {
        if !store.enabled {
            continue;
        }
        let Ok(driver) = store.driver() else {
            continue;
        };
        if !driver.available() {
            continue;
        }
        let Ok(report) = driver.report() else {
            continue;
        };
        if report.full || largest > report.free {
            continue;
        }
        if best.as_ref().map_or(true, |(free, _)| report.free > *free) {
            best = Some((report.free, store));
        }
    }
    best.map(|(_, store)| store)
        .ok_or_else(|| ApiError::StoreFull("no store can accept the clone batch".into()))
}

/// `POST /api/v2/clone/stage_batch` — READAPPEND. Idempotent per file via
/// the source transfer id.
pub async fn stage_batch(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CloneBatchStageRequest>,
) -> Result<Json<CloneBatchStageResponse>, ApiError> {
    require(&user, AuthLevel::ReadAppend)?;

    if request.files.is_empty() {
        return Err(ApiError::BadRequest("empty stage batch".into()));
    }
    let largest = request.files.iter().map(|f| f.size).max().unwrap_or(0);
    let store = choose_clone_store(&state, largest)?;
    let driver = store.driver().map_err(ApiError::from)?;

    let mut stanzas: Vec<CloneStagedStanza> = Vec::new();
    let mut rejected: BTreeMap<i64, String> = BTreeMap::new();

    for file in &request.files {
        let source_transfer_id = file.source_transfer_id;

        // Replay of a transfer we already staged: repeat the prior answer.
        let prior = state
            .ctx
            .with_db(|c| {
                IncomingTransfer::find_by_source_key(c, &request.source, source_transfer_id)
            })
            .map_err(ApiError::from)?;
        if let Some(prior) = prior {
            match (&prior.staging_path, prior.status) {
                (Some(staging_path), status) if !status.is_terminal() => {
                    stanzas.push(CloneStagedStanza {
                        name: file.name.clone(),
                        source_transfer_id,
                        destination_transfer_id: prior.id,
                        staging_path: staging_path.clone(),
                    });
                    continue;
                }
                _ => {
                    rejected.insert(
                        source_transfer_id,
                        format!("transfer previously ended as {}", prior.status),
                    );
                    continue;
                }
            }
        }

        // A file we already hold can never be staged again.
        let existing = state
            .ctx
            .with_db(|c| File::get(c, &file.name))
            .map_err(ApiError::from)?;
        if let Some(existing) = existing {
            let reason = if existing.checksum.matches(&file.checksum) {
                "file already present with identical checksum".to_string()
            } else {
                "file name already taken with a different checksum".to_string()
            };
            rejected.insert(source_transfer_id, reason);
            continue;
        }

        // A different in-flight transfer with the same payload: both
        // sides must fail their halves and start over.
        let conflicting = state
            .ctx
            .with_db(|c| IncomingTransfer::active_with_checksum(c, &file.checksum))
            .map_err(ApiError::from)?;
        if !conflicting.is_empty() {
            state
                .ctx
                .with_db(|c| {
                    for mut other in conflicting {
                        if let (Some(store_id), Some(staging_path)) =
                            (other.store_id, other.staging_path.clone())
                        {
                            if let Some(other_store) = StoreRow::get(c, store_id)? {
                                if let Ok(other_driver) = other_store.driver() {
                                    if let Some(dir) =
                                        std::path::Path::new(&staging_path).parent()
                                    {
                                        let _ = other_driver.unstage(dir);
                                    }
                                }
                            }
                        }
                        other.fail(c, "superseded by a new stage request")?;
                    }
                    Ok(())
                })
                .map_err(ApiError::from)?;
            rejected.insert(
                source_transfer_id,
                "an active transfer with this checksum existed; both halves failed".to_string(),
            );
            continue;
        }

        // Fresh transfer: record it and allocate its staging slot.
        let result = state.ctx.with_db(|c| {
            let mut transfer = IncomingTransfer::new_transfer(
                c,
                &request.source,
                source_transfer_id,
                &file.uploader,
                &file.name,
                file.size,
                &file.checksum,
            )?;
            let slot = store.stage_clone(&file.name, file.size)?;
            transfer.record_staging(c, store.id, &slot.path.display().to_string())?;
            Ok((transfer.id, slot))
        });
        match result {
            Ok((destination_transfer_id, slot)) => stanzas.push(CloneStagedStanza {
                name: file.name.clone(),
                source_transfer_id,
                destination_transfer_id,
                staging_path: slot.path.display().to_string(),
            }),
            Err(e) => {
                rejected.insert(source_transfer_id, e.to_string());
            }
        }
    }

    Ok(Json(CloneBatchStageResponse {
        store_name: store.name,
        destination_endpoint: driver.async_endpoint(),
        accepted_async_managers: driver.async_transfer_managers(),
        stanzas,
        rejected,
    }))
}

/// `POST /api/v2/clone/complete` — CALLBACK. The destination reports a
/// finished ingest; we record the remote instance and close our transfer.
pub async fn complete(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CloneCompleteRequest>,
) -> Result<Json<CloneCompleteResponse>, ApiError> {
    require(&user, AuthLevel::Callback)?;

    state
        .ctx
        .with_db(|c| {
            let mut transfer = OutgoingTransfer::get(c, request.source_transfer_id)?
                .ok_or(arca_core::CoreError::TransferNotFound(request.source_transfer_id))?;

            // Duplicate callback: the first delivery already did the work.
            if transfer.status == TransferStatus::Completed {
                return Ok(());
            }

            let librarian = Librarian::get_by_name(c, &transfer.destination)?
                .ok_or_else(|| {
                    arca_core::CoreError::LibrarianNotFound(transfer.destination.clone())
                })?;

            // A completion can legitimately arrive while we still think
            // the batch is ONGOING (their receive worker beat our queue
            // checker); sync forward first.
            if transfer.status == TransferStatus::Ongoing {
                transfer.advance(c, TransferStatus::Staged)?;
            }
            RemoteInstance::create(
                c,
                &transfer.file_name,
                librarian.id,
                Some(&request.store_name),
            )?;
            transfer.advance(c, TransferStatus::Completed)?;
            librarian.record_seen(c)?;
            tracing::info!(
                transfer = transfer.id,
                file = %transfer.file_name,
                peer = %librarian.name,
                "outgoing transfer completed"
            );
            Ok(())
        })
        .map_err(ApiError::from)?;

    Ok(Json(CloneCompleteResponse {
        source_transfer_id: request.source_transfer_id,
        destination_transfer_id: request.destination_transfer_id,
    }))
}

/// `POST /api/v2/clone/fail` — READAPPEND. The source abandons an
/// incoming transfer of ours; idempotent on terminal transfers.
pub async fn fail(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CloneFailRequest>,
) -> Result<Json<CloneFailResponse>, ApiError> {
    require(&user, AuthLevel::ReadAppend)?;

    state
        .ctx
        .with_db(|c| {
            let Some(mut transfer) = IncomingTransfer::get(c, request.destination_transfer_id)?
            else {
                return Err(arca_core::CoreError::TransferNotFound(
                    request.destination_transfer_id,
                ));
            };
            if transfer.status.is_terminal() {
                return Ok(());
            }
            if let (Some(store_id), Some(staging_path)) =
                (transfer.store_id, transfer.staging_path.clone())
            {
                if let Some(store) = StoreRow::get(c, store_id)? {
                    if let Ok(driver) = store.driver() {
                        if let Some(dir) = std::path::Path::new(&staging_path).parent() {
                            let _ = driver.unstage(dir);
                        }
                    }
                }
            }
            transfer.fail(c, &request.reason)?;
            log_error(
                c,
                ErrorSeverity::Warning,
                ErrorCategory::Transport,
                &format!(
                    "incoming transfer {} failed by source: {}",
                    transfer.id, request.reason
                ),
            )?;
            Ok(())
        })
        .map_err(ApiError::from)?;

    Ok(Json(CloneFailResponse {
        destination_transfer_id: request.destination_transfer_id,
        success: true,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::super::test_helpers::*;
    use arca_core::models::{
        DeletionPolicy, File, Instance, Librarian, OutgoingTransfer, RemoteInstance,
    };
    use arca_protocol::{Checksum, TransferStatus};

    fn stage_request(source_transfer_id: i64) -> serde_json::Value {
        serde_json::json!({
            "batch_id": "feedbeefcafe0001",
            "source": "site-remote",
            "files": [{
                "name": "zen.2457644.12345.uv",
                "size": 64,
                "checksum": "0".repeat(32),
                "uploader": "obs",
                "source_transfer_id": source_transfer_id,
            }],
        })
    }

    #[tokio::test]
    async fn stage_batch_allocates_and_replays_idempotently() {
        let (router, _state, _tmp) = setup_app(1 << 20);

        let resp = post_json(
            router.clone(),
            UPLOADER,
            "/api/v2/clone/stage_batch",
            stage_request(41),
        )
        .await;
        assert_status(&resp, StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["store_name"], "vault");
        assert_eq!(body["stanzas"].as_array().unwrap().len(), 1);
        let first_path = body["stanzas"][0]["staging_path"].as_str().unwrap().to_string();
        let first_id = body["stanzas"][0]["destination_transfer_id"].as_i64().unwrap();

        // Replaying the same idempotency key returns the same slot.
        let resp = post_json(
            router,
            UPLOADER,
            "/api/v2/clone/stage_batch",
            stage_request(41),
        )
        .await;
        assert_status(&resp, StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["stanzas"][0]["staging_path"], first_path.as_str());
        assert_eq!(body["stanzas"][0]["destination_transfer_id"], first_id);
    }

    #[tokio::test]
    async fn stage_batch_rejects_known_files() {
        let (router, state, _tmp) = setup_app(1 << 20);
        state
            .ctx
            .with_db(|c| {
                File::create(
                    c,
                    "zen.2457644.12345.uv",
                    64,
                    &Checksum::parse(&"1".repeat(32)).unwrap(),
                    "obs",
                    "site-test",
                )?;
                Ok(())
            })
            .unwrap();

        let resp = post_json(
            router,
            UPLOADER,
            "/api/v2/clone/stage_batch",
            stage_request(42),
        )
        .await;
        assert_status(&resp, StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["stanzas"].as_array().unwrap().is_empty());
        assert!(body["rejected"]["42"].as_str().unwrap().contains("different checksum"));
    }

    #[tokio::test]
    async fn staged_update_then_complete_flow() {
        let (router, state, _tmp) = setup_app(1 << 20);

        // Stage an incoming transfer as the peer would.
        let resp = post_json(
            router.clone(),
            UPLOADER,
            "/api/v2/clone/stage_batch",
            stage_request(7),
        )
        .await;
        let body = body_json(resp).await;
        let incoming_id = body["stanzas"][0]["destination_transfer_id"].as_i64().unwrap();

        // Peer marks it staged (idempotent on repeat).
        for _ in 0..2 {
            let resp = post_json(
                router.clone(),
                UPLOADER,
                "/api/v2/checkin/update",
                serde_json::json!({
                    "destination_transfer_ids": [incoming_id],
                    "new_status": "STAGED",
                }),
            )
            .await;
            assert_status(&resp, StatusCode::OK);
            let body = body_json(resp).await;
            assert_eq!(body["updated"][0], incoming_id);
        }

        // Status query resolves by the source's outgoing id.
        let resp = post_json(
            router,
            UPLOADER,
            "/api/v2/checkin/status",
            serde_json::json!({"source_transfer_ids": [7]}),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["incoming_status"]["7"]["status"], "STAGED");

        let transfer = state
            .ctx
            .with_db(|c| arca_core::models::IncomingTransfer::get(c, incoming_id))
            .unwrap()
            .unwrap();
        assert_eq!(transfer.status, TransferStatus::Staged);
    }

    #[tokio::test]
    async fn complete_callback_is_idempotent() {
        let (router, state, _tmp) = setup_app(1 << 20);

        // Source-side fixture: a file with a STAGED outgoing transfer.
        let transfer_id = state
            .ctx
            .with_db(|c| {
                let checksum = Checksum::parse(&"2".repeat(32)).unwrap();
                File::create(c, "f.dat", 4, &checksum, "obs", "site-test")?;
                let store = arca_core::models::StoreRow::get_by_name(c, "vault")?.unwrap();
                let instance =
                    Instance::create(c, "f.dat", store.id, "f.dat", DeletionPolicy::Disallowed)?;
                Librarian::create(
                    c,
                    &state.ctx.keys,
                    "peer-b",
                    "http://peer-b.invalid",
                    80,
                    "bot:pw",
                )?;
                let mut transfer = OutgoingTransfer::new_transfer(
                    c, "peer-b", "f.dat", instance.id, store.id, 4, &checksum, "/x/f.dat",
                )?;
                transfer.advance(c, TransferStatus::Ongoing)?;
                transfer.advance(c, TransferStatus::Staged)?;
                Ok(transfer.id)
            })
            .unwrap();

        let request = serde_json::json!({
            "source_transfer_id": transfer_id,
            "destination_transfer_id": 99,
            "store_name": "remote-vault",
            "instance_path": "f.dat",
        });

        for _ in 0..2 {
            let resp = post_json(router.clone(), ADMIN, "/api/v2/clone/complete", request.clone())
                .await;
            assert_status(&resp, StatusCode::OK);
        }

        state
            .ctx
            .with_db(|c| {
                let transfer = OutgoingTransfer::get(c, transfer_id)?.unwrap();
                assert_eq!(transfer.status, TransferStatus::Completed);
                let remotes = RemoteInstance::for_file(c, "f.dat")?;
                assert_eq!(remotes.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn callback_level_is_enforced() {
        let (router, _state, _tmp) = setup_app(1 << 20);
        // READONLY sits below CALLBACK in the level order.
        let resp = post_json(
            router,
            READER,
            "/api/v2/clone/complete",
            serde_json::json!({
                "source_transfer_id": 1,
                "destination_transfer_id": 1,
                "store_name": "x",
                "instance_path": "y",
            }),
        )
        .await;
        assert_status(&resp, StatusCode::FORBIDDEN);
    }
}
