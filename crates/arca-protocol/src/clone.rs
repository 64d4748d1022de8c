//! Peer-to-peer clone protocol.
//!
//! The push flow between a source instance A and a destination B:
//!
//! 1. A's `send_clone` task batches files and calls B's `clone/stage_batch`.
//!    B creates one IncomingTransfer and one staging directory per file and
//!    answers with a destination endpoint identifier.
//! 2. A's queue consumer moves the bytes asynchronously into B's staging
//!    directories, then A's checker calls B's `checkin/update` to mark the
//!    incoming transfers STAGED.
//! 3. B's `receive_clone` task ingests each staged file into a store and
//!    calls back A's `clone/complete`; A records a RemoteInstance and
//!    completes its OutgoingTransfer.
//!
//! Every request carries the source's outgoing-transfer id as the
//! idempotency key; replays return the previously computed answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// One file within a `stage_batch` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneFileStanza {
    pub name: String,
    pub size: u64,
    pub checksum: Checksum,
    /// The identity that originally uploaded the file.
    pub uploader: String,
    /// Source-side OutgoingTransfer id; the idempotency key.
    pub source_transfer_id: i64,
}

/// `POST /api/v2/clone/stage_batch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneBatchStageRequest {
    /// Opaque batch identifier minted by the source.
    pub batch_id: String,
    /// The source instance's configured name.
    pub source: String,
    pub files: Vec<CloneFileStanza>,
}

/// Per-file staging slot returned by the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneStagedStanza {
    pub name: String,
    pub source_transfer_id: i64,
    /// Destination-side IncomingTransfer id.
    pub destination_transfer_id: i64,
    /// Absolute staging path on the destination endpoint for this file.
    pub staging_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneBatchStageResponse {
    pub store_name: String,
    /// Identifier of the transport endpoint that serves the staging area
    /// (a host name for rsync-style transports, an endpoint id otherwise).
    pub destination_endpoint: String,
    /// Async transfer manager names the destination store accepts.
    pub accepted_async_managers: Vec<String>,
    pub stanzas: Vec<CloneStagedStanza>,
    /// Files the destination refused, keyed by source transfer id. The
    /// source fails the corresponding outgoing transfers.
    #[serde(default)]
    pub rejected: BTreeMap<i64, String>,
}

/// `POST /api/v2/clone/complete` — destination → source callback after a
/// successful ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneCompleteRequest {
    pub source_transfer_id: i64,
    pub destination_transfer_id: i64,
    /// Store the instance landed on, and its committed path.
    pub store_name: String,
    pub instance_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneCompleteResponse {
    pub source_transfer_id: i64,
    pub destination_transfer_id: i64,
}

/// `POST /api/v2/clone/fail` — either side asks the other to fail its half
/// of a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneFailRequest {
    pub destination_transfer_id: i64,
    pub source_transfer_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneFailResponse {
    pub destination_transfer_id: i64,
    pub success: bool,
}
