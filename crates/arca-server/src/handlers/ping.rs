use axum::extract::State;
use axum::{Extension, Json};

use arca_protocol::ping::{PingRequest, PingResponse};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::ServerState;

/// `POST /api/v2/ping` — identity exchange; any authenticated caller.
pub async fn ping(
    State(state): State<ServerState>,
    Extension(_user): Extension<AuthUser>,
    Json(request): Json<PingRequest>,
) -> Result<Json<PingResponse>, ApiError> {
    if request.protocol_version != 0 {
        arca_protocol::check_protocol_version(request.protocol_version)
            .map_err(ApiError::BadRequest)?;
    }
    Ok(Json(PingResponse {
        name: state.config.name.clone(),
        description: state.config.displayed_site_description.clone(),
    }))
}
