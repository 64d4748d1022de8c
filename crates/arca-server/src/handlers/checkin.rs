//! Transfer check-in: batch status queries and the staged update driven
//! by a source's queue checker.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::{Extension, Json};

use arca_core::models::{IncomingTransfer, OutgoingTransfer};
use arca_protocol::checkin::{
    CheckinStatusRequest, CheckinStatusResponse, CheckinUpdateRequest, CheckinUpdateResponse,
    TransferStatusReport,
};
use arca_protocol::{AuthLevel, TransferStatus};

use crate::auth::{require, AuthUser};
use crate::error::ApiError;
use crate::state::ServerState;

/// `POST /api/v2/checkin/status` — CALLBACK. Ids are the source-side
/// outgoing transfer ids; both tables are consulted so either end of a
/// transfer can ask. Ids we have never seen are simply absent.
pub async fn status(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CheckinStatusRequest>,
) -> Result<Json<CheckinStatusResponse>, ApiError> {
    require(&user, AuthLevel::Callback)?;

    let response = state
        .ctx
        .with_db(|c| {
            let mut incoming_status = BTreeMap::new();
            let mut outgoing_status = BTreeMap::new();
            for &id in &request.source_transfer_ids {
                if let Some(transfer) = IncomingTransfer::find_by_source_transfer_id(c, id)? {
                    incoming_status.insert(
                        id,
                        TransferStatusReport {
                            status: transfer.status,
                            since: transfer.end_time.unwrap_or(transfer.start_time),
                        },
                    );
                }
                if let Some(transfer) = OutgoingTransfer::get(c, id)? {
                    outgoing_status.insert(
                        id,
                        TransferStatusReport {
                            status: transfer.status,
                            since: transfer.end_time.unwrap_or(transfer.start_time),
                        },
                    );
                }
            }
            Ok(CheckinStatusResponse {
                incoming_status,
                outgoing_status,
            })
        })
        .map_err(ApiError::from)?;

    Ok(Json(response))
}

/// `POST /api/v2/checkin/update` — READAPPEND. The only transition peers
/// may drive remotely is INITIATED → STAGED; repeats are idempotent.
pub async fn update(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CheckinUpdateRequest>,
) -> Result<Json<CheckinUpdateResponse>, ApiError> {
    require(&user, AuthLevel::ReadAppend)?;

    if request.new_status != TransferStatus::Staged {
        return Err(ApiError::BadRequest(format!(
            "peers may only set STAGED, not {}",
            request.new_status
        )));
    }

    let response = state
        .ctx
        .with_db(|c| {
            let mut updated = Vec::new();
            let mut rejected = BTreeMap::new();
            for &id in &request.destination_transfer_ids {
                let Some(mut transfer) = IncomingTransfer::get(c, id)? else {
                    rejected.insert(id, "unknown transfer".to_string());
                    continue;
                };
                match transfer.advance(c, TransferStatus::Staged) {
                    Ok(()) => updated.push(id),
                    Err(e) => {
                        rejected.insert(id, e.to_string());
                    }
                }
            }
            Ok(CheckinUpdateResponse { updated, rejected })
        })
        .map_err(ApiError::from)?;

    Ok(Json(response))
}
