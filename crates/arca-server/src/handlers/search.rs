//! Search, locate, and validate endpoints.

use axum::extract::State;
use axum::{Extension, Json};

use arca_core::models::{File, Instance, Librarian, RemoteInstance, StoreRow};
use arca_protocol::instances::{FileLocation, LocateFileRequest, LocateFileResponse};
use arca_protocol::search::{
    FileDescriptor, FileSearchRequest, FileSearchResponse, InstanceDescriptor,
    RemoteInstanceDescriptor,
};
use arca_protocol::validate::{FileValidationRequest, FileValidationResponse, FileValidationRow};
use arca_protocol::AuthLevel;

use crate::auth::{require, AuthUser};
use crate::error::ApiError;
use crate::state::ServerState;

fn describe_file(
    conn: &arca_core::rusqlite::Connection,
    file: &File,
) -> Result<FileDescriptor, arca_core::CoreError> {
    let mut instances = Vec::new();
    for instance in Instance::for_file(conn, &file.name)? {
        let store_name = StoreRow::get(conn, instance.store_id)?
            .map(|s| s.name)
            .unwrap_or_default();
        instances.push(InstanceDescriptor {
            id: instance.id,
            store_name,
            path: instance.path,
            available: instance.available,
            created_time: instance.created_time,
        });
    }
    let mut remote_instances = Vec::new();
    for remote in RemoteInstance::for_file(conn, &file.name)? {
        let librarian_name = Librarian::get(conn, remote.librarian_id)?
            .map(|l| l.name)
            .unwrap_or_default();
        remote_instances.push(RemoteInstanceDescriptor {
            librarian_name,
            copy_time: remote.copy_time,
        });
    }
    Ok(FileDescriptor {
        name: file.name.clone(),
        size: file.size,
        checksum: file.checksum.clone(),
        create_time: file.create_time,
        uploader: file.uploader.clone(),
        source: file.source.clone(),
        instances,
        remote_instances,
    })
}

/// `POST /api/v2/search/files` — READONLY. Administrative callers bypass
/// the configured result cap.
pub async fn search_files(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<FileSearchRequest>,
) -> Result<Json<FileSearchResponse>, ApiError> {
    require(&user, AuthLevel::ReadOnly)?;

    let cap = if user.level >= AuthLevel::Admin {
        request.max_results.unwrap_or(usize::MAX - 1).min(1_000_000)
    } else {
        request
            .max_results
            .unwrap_or(state.config.max_search_results)
            .min(state.config.max_search_results)
    };

    let results = state
        .ctx
        .with_db(|c| {
            let files = File::search(c, &request, cap)?;
            files.iter().map(|f| describe_file(c, f)).collect()
        })
        .map_err(ApiError::from)?;

    Ok(Json(FileSearchResponse { results }))
}

/// `POST /api/v2/files/locate` — READONLY.
pub async fn locate_file(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<LocateFileRequest>,
) -> Result<Json<LocateFileResponse>, ApiError> {
    require(&user, AuthLevel::ReadOnly)?;

    let locations = state
        .ctx
        .with_db(|c| {
            if !File::exists(c, &request.name)? {
                return Err(arca_core::CoreError::FileNotFound(request.name.clone()));
            }
            let mut out = Vec::new();
            for instance in Instance::for_file(c, &request.name)? {
                if !instance.available {
                    continue;
                }
                let store_name = StoreRow::get(c, instance.store_id)?.map(|s| s.name);
                out.push(FileLocation {
                    store: store_name,
                    path: Some(instance.path),
                    librarian: None,
                });
            }
            for remote in RemoteInstance::for_file(c, &request.name)? {
                let librarian = Librarian::get(c, remote.librarian_id)?.map(|l| l.name);
                out.push(FileLocation {
                    store: remote.store_name,
                    path: None,
                    librarian,
                });
            }
            Ok(out)
        })
        .map_err(ApiError::from)?;

    Ok(Json(LocateFileResponse { locations }))
}

/// `POST /api/v2/validate/file` — READAPPEND. Re-hashes every local copy,
/// then asks each peer holding a RemoteInstance to do the same (the peer
/// call is marked local-only so validation doesn't cascade).
pub async fn validate_file(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<FileValidationRequest>,
) -> Result<Json<FileValidationResponse>, ApiError> {
    require(&user, AuthLevel::ReadAppend)?;

    let name = request.name.clone();
    let state_for_task = state.clone();
    let rows = tokio::task::spawn_blocking(move || validate_blocking(&state_for_task, &name, request.local_only))
        .await
        .map_err(|e| ApiError::Internal(format!("validation task panicked: {e}")))?
        .map_err(ApiError::from)?;

    Ok(Json(FileValidationResponse { results: rows }))
}

fn validate_blocking(
    state: &ServerState,
    name: &str,
    local_only: bool,
) -> Result<Vec<FileValidationRow>, arca_core::CoreError> {
    let (file, instances, remotes) = state.ctx.with_db(|c| {
        let file = File::get(c, name)?
            .ok_or_else(|| arca_core::CoreError::FileNotFound(name.to_string()))?;
        let instances = Instance::for_file(c, name)?;
        let remotes = RemoteInstance::for_file(c, name)?;
        Ok((file, instances, remotes))
    })?;

    let mut rows = Vec::new();

    for instance in instances.iter().filter(|i| i.available) {
        let Some(store) = state.ctx.with_db(|c| StoreRow::get(c, instance.store_id))? else {
            continue;
        };
        let driver = store.driver()?;
        match driver.path_info(&instance.path) {
            Ok(info) => rows.push(FileValidationRow {
                librarian: state.config.name.clone(),
                store: store.name.clone(),
                instance_id: instance.id,
                original_checksum: file.checksum.clone(),
                matches: info.checksum.matches(&file.checksum),
                current_checksum: info.checksum,
                current_size: info.size,
            }),
            Err(e) => {
                tracing::warn!(
                    file = %name,
                    instance = instance.id,
                    error = %e,
                    "could not measure instance during validation"
                );
            }
        }
    }

    if local_only {
        return Ok(rows);
    }

    for remote in remotes {
        let Some(librarian) = state.ctx.with_db(|c| Librarian::get(c, remote.librarian_id))?
        else {
            continue;
        };
        let request = FileValidationRequest {
            name: name.to_string(),
            local_only: true,
        };
        match librarian
            .client(&state.ctx.keys)
            .and_then(|client| {
                client
                    .post::<_, FileValidationResponse>("validate/file", &request)
                    .map_err(arca_core::CoreError::from)
            }) {
            Ok(response) => rows.extend(response.results),
            Err(e) => {
                let _ = state.ctx.with_db(|c| librarian.record_error(c, &e.to_string()));
                tracing::warn!(
                    peer = %librarian.name,
                    file = %name,
                    error = %e,
                    "peer validation failed"
                );
            }
        }
    }

    Ok(rows)
}
