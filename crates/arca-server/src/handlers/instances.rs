use axum::extract::State;
use axum::{Extension, Json};

use arca_core::models::{File, Instance, StoreRow};
use arca_protocol::instances::{InstanceDeleteRequest, InstanceDeleteResponse};
use arca_protocol::AuthLevel;

use crate::auth::{require, AuthUser};
use crate::error::ApiError;
use crate::state::ServerState;

/// `POST /api/v2/instances/delete` — READWRITE. Soft delete: the instance
/// is marked unavailable; the bytes stay until deletion tooling removes
/// them. The deletion policy is checked here and again inside the model.
pub async fn delete_instance(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<InstanceDeleteRequest>,
) -> Result<Json<InstanceDeleteResponse>, ApiError> {
    require(&user, AuthLevel::ReadWrite)?;

    state
        .ctx
        .with_db(|c| {
            if !File::exists(c, &request.name)? {
                return Err(arca_core::CoreError::FileNotFound(request.name.clone()));
            }
            let store = StoreRow::get_by_name(c, &request.store)?
                .ok_or_else(|| arca_core::CoreError::StoreNotFound(request.store.clone()))?;
            let instance = Instance::find(c, &request.name, store.id)?.ok_or_else(|| {
                arca_core::CoreError::FileNotFound(format!(
                    "{} has no instance on {}",
                    request.name, request.store
                ))
            })?;

            if instance.deletion_policy == arca_core::models::DeletionPolicy::Disallowed {
                return Err(arca_core::CoreError::DeletionDisallowed(instance.id));
            }
            instance.mark_unavailable(c, false)?;
            Ok(())
        })
        .map_err(ApiError::from)?;

    Ok(Json(InstanceDeleteResponse {
        marked_unavailable: true,
    }))
}
