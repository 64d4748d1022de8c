//! Administrative endpoints: users, peers, store state, store manifests.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;

use arca_core::models::{Instance, Librarian, OutgoingTransfer, StoreRow, User};
use arca_protocol::admin::{
    LibrarianAddRequest, LibrarianAddResponse, LibrarianRemoveRequest, LibrarianRemoveResponse,
    LibrarianTransferRequest, LibrarianTransferResponse, StoreManifestRequest, StoreStateRequest,
    StoreStateResponse, UserCreateRequest, UserCreateResponse, UserDeleteRequest,
    UserDeleteResponse,
};
use arca_protocol::manifest::{ManifestItem, StoreManifest, MANIFEST_VERSION};
use arca_protocol::{AuthLevel, TransferStatus};

use crate::auth::{require, AuthUser};
use crate::error::ApiError;
use crate::state::ServerState;

/// `POST /api/v2/users/create` — ADMIN.
pub async fn create_user(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<UserCreateRequest>,
) -> Result<Json<UserCreateResponse>, ApiError> {
    require(&user, AuthLevel::Admin)?;

    state
        .ctx
        .with_db(|c| User::create(c, &request.username, &request.password, request.auth_level))
        .map_err(|e| match e {
            arca_core::CoreError::Database(_) => {
                ApiError::Conflict(format!("user '{}' already exists", request.username))
            }
            other => ApiError::from(other),
        })?;

    Ok(Json(UserCreateResponse {
        username: request.username,
    }))
}

/// `POST /api/v2/users/delete` — ADMIN.
pub async fn delete_user(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<UserDeleteRequest>,
) -> Result<Json<UserDeleteResponse>, ApiError> {
    require(&user, AuthLevel::Admin)?;

    if request.username == user.username {
        return Err(ApiError::BadRequest("refusing to delete yourself".into()));
    }
    let deleted = state
        .ctx
        .with_db(|c| User::delete(c, &request.username))
        .map_err(ApiError::from)?;
    Ok(Json(UserDeleteResponse { deleted }))
}

/// `POST /api/v2/admin/librarians/add` — ADMIN.
pub async fn add_librarian(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<LibrarianAddRequest>,
) -> Result<Json<LibrarianAddResponse>, ApiError> {
    require(&user, AuthLevel::Admin)?;

    let librarian = state
        .ctx
        .with_db(|c| {
            Librarian::create(
                c,
                &state.ctx.keys,
                &request.name,
                &request.url,
                request.port,
                &request.authenticator,
            )
        })
        .map_err(|e| match e {
            arca_core::CoreError::Database(_) => {
                ApiError::Conflict(format!("librarian '{}' already exists", request.name))
            }
            other => ApiError::from(other),
        })?;

    let ping_ok = if request.check_connection {
        let state = state.clone();
        let librarian = librarian.clone();
        let ok = tokio::task::spawn_blocking(move || {
            librarian
                .client(&state.ctx.keys)
                .and_then(|client| {
                    client
                        .ping_checked(&librarian.name)
                        .map_err(arca_core::CoreError::from)
                })
                .is_ok()
        })
        .await
        .unwrap_or(false);
        Some(ok)
    } else {
        None
    };

    Ok(Json(LibrarianAddResponse {
        name: request.name,
        ping_ok,
    }))
}

/// `POST /api/v2/admin/librarians/remove` — ADMIN.
pub async fn remove_librarian(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<LibrarianRemoveRequest>,
) -> Result<Json<LibrarianRemoveResponse>, ApiError> {
    require(&user, AuthLevel::Admin)?;

    let removed = state
        .ctx
        .with_db(|c| {
            let Some(librarian) = Librarian::get_by_name(c, &request.name)? else {
                return Ok(false);
            };
            librarian.remove(c)?;
            Ok(true)
        })
        .map_err(ApiError::from)?;
    Ok(Json(LibrarianRemoveResponse { removed }))
}

/// `POST /api/v2/admin/librarians/set_transfer` — ADMIN.
pub async fn set_librarian_transfer(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<LibrarianTransferRequest>,
) -> Result<Json<LibrarianTransferResponse>, ApiError> {
    require(&user, AuthLevel::Admin)?;

    state
        .ctx
        .with_db(|c| {
            let librarian = Librarian::get_by_name(c, &request.name)?
                .ok_or_else(|| arca_core::CoreError::LibrarianNotFound(request.name.clone()))?;
            librarian.set_transfer_enabled(c, request.enabled)
        })
        .map_err(ApiError::from)?;

    Ok(Json(LibrarianTransferResponse {
        name: request.name,
        enabled: request.enabled,
    }))
}

/// `POST /api/v2/admin/stores/set_state` — ADMIN.
pub async fn set_store_state(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<StoreStateRequest>,
) -> Result<Json<StoreStateResponse>, ApiError> {
    require(&user, AuthLevel::Admin)?;

    let (enabled, ingestible) = state
        .ctx
        .with_db(|c| {
            let store = StoreRow::get_by_name(c, &request.name)?
                .ok_or_else(|| arca_core::CoreError::StoreNotFound(request.name.clone()))?;
            store.set_state(c, request.enabled, request.ingestible)?;
            let store = StoreRow::get(c, store.id)?
                .ok_or_else(|| arca_core::CoreError::StoreNotFound(request.name.clone()))?;
            Ok((store.enabled, store.ingestible))
        })
        .map_err(ApiError::from)?;

    Ok(Json(StoreStateResponse {
        name: request.name,
        enabled,
        ingestible,
    }))
}

/// `POST /api/v2/admin/stores/manifest` — ADMIN. Generate a SneakerNet
/// manifest for a store, optionally creating STAGED outgoing transfers,
/// disabling the store, and marking its instances unavailable.
pub async fn get_store_manifest(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<StoreManifestRequest>,
) -> Result<Json<StoreManifest>, ApiError> {
    require(&user, AuthLevel::Admin)?;

    if request.create_outgoing_transfers && request.destination_librarian.is_none() {
        return Err(ApiError::BadRequest(
            "create_outgoing_transfers requires destination_librarian".into(),
        ));
    }

    let state_for_task = state.clone();
    let manifest = tokio::task::spawn_blocking(move || {
        build_manifest(&state_for_task, &request)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("manifest task panicked: {e}")))?
    .map_err(ApiError::from)?;

    Ok(Json(manifest))
}

fn build_manifest(
    state: &ServerState,
    request: &StoreManifestRequest,
) -> Result<StoreManifest, arca_core::CoreError> {
    let store = state
        .ctx
        .with_db(|c| StoreRow::get_by_name(c, &request.store_name))?
        .ok_or_else(|| arca_core::CoreError::StoreNotFound(request.store_name.clone()))?;
    let driver = store.driver()?;

    let mut items = Vec::new();
    state.ctx.transaction(|tx| {
        items.clear();
        let mut stmt = tx.prepare(
            "SELECT i.id, i.file_name, i.path, f.size, f.checksum
             FROM instances i JOIN files f ON f.name = i.file_name
             WHERE i.store_id = ?1 AND i.available = 1
             ORDER BY i.file_name",
        )?;
        let rows: Vec<(i64, String, String, i64, String)> = stmt
            .query_map([store.id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for (instance_id, file_name, path, size, checksum) in rows {
            let checksum = arca_protocol::Checksum::parse(&checksum)
                .map_err(arca_core::CoreError::Config)?;

            let outgoing_transfer_id = if request.create_outgoing_transfers {
                let destination = request
                    .destination_librarian
                    .as_deref()
                    .unwrap_or_default();
                let source_path = driver.resolve(&path)?;
                let mut transfer = OutgoingTransfer::new_transfer(
                    tx,
                    destination,
                    &file_name,
                    instance_id,
                    store.id,
                    size as u64,
                    &checksum,
                    &source_path.display().to_string(),
                )?;
                // The bytes travel on the device itself: the transfer is
                // born past the transport phase.
                transfer.advance(tx, TransferStatus::Ongoing)?;
                transfer.advance(tx, TransferStatus::Staged)?;
                Some(transfer.id)
            } else {
                None
            };

            if request.mark_local_instances_as_unavailable {
                if let Some(instance) = Instance::get(tx, instance_id)? {
                    instance.mark_unavailable(tx, true)?;
                }
            }

            items.push(ManifestItem {
                name: file_name,
                size: size as u64,
                checksum,
                relative_path: path,
                outgoing_transfer_id,
            });
        }

        if request.disable_store {
            store.disable(tx)?;
        }
        Ok(())
    })?;

    Ok(StoreManifest {
        version: MANIFEST_VERSION,
        source_librarian: state.config.name.clone(),
        destination_librarian: request.destination_librarian.clone(),
        generated_at: Utc::now(),
        store_name: store.name.clone(),
        items,
    })
}
