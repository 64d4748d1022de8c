use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// `POST /api/v2/validate/file` — re-hash every reachable copy of a file,
/// local and remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileValidationRequest {
    pub name: String,
    /// Set on instance-to-instance validation calls so peers report only
    /// their own copies instead of fanning out further.
    #[serde(default)]
    pub local_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileValidationRow {
    /// The instance that answered; our own name for local instances.
    pub librarian: String,
    pub store: String,
    pub instance_id: i64,
    pub original_checksum: Checksum,
    pub current_checksum: Checksum,
    pub current_size: u64,
    #[serde(rename = "match")]
    pub matches: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileValidationResponse {
    pub results: Vec<FileValidationRow>,
}
