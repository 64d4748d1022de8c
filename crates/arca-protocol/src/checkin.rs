//! Transfer check-in: batch status queries and updates between peers.
//! Used by the queue checker (to mark remote transfers STAGED) and by the
//! hypervisors (to learn a peer's ground truth for a stuck transfer).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transfer::TransferStatus;

/// `POST /api/v2/checkin/status`
///
/// Ids are always *source-side outgoing transfer ids* — the one id both
/// ends of a transfer know. The callee answers from whichever of its
/// tables carries the id: its IncomingTransfers when it is the
/// destination, its OutgoingTransfers when it is the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckinStatusRequest {
    pub source_transfer_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatusReport {
    pub status: TransferStatus,
    /// When the transfer entered this state (its end time for terminal
    /// states, otherwise its start).
    pub since: DateTime<Utc>,
}

/// Ids the callee has never seen are absent from both maps; callers must
/// treat absence as UNKNOWN.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckinStatusResponse {
    /// The callee's IncomingTransfers, keyed by the id asked with.
    #[serde(default)]
    pub incoming_status: BTreeMap<i64, TransferStatusReport>,
    /// The callee's OutgoingTransfers, keyed by the id asked with.
    #[serde(default)]
    pub outgoing_status: BTreeMap<i64, TransferStatusReport>,
}

/// `POST /api/v2/checkin/update` — batch status advance on the callee's
/// IncomingTransfers (INITIATED → STAGED is the only transition peers may
/// drive remotely).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinUpdateRequest {
    /// Callee-side IncomingTransfer ids, learned at stage time.
    pub destination_transfer_ids: Vec<i64>,
    pub new_status: TransferStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinUpdateResponse {
    /// Ids actually updated; already-in-state ids are included (idempotent).
    pub updated: Vec<i64>,
    /// Ids the callee could not update, with reasons.
    #[serde(default)]
    pub rejected: BTreeMap<i64, String>,
}
