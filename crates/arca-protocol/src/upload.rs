use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// Query parameters of `POST /api/v2/upload`. The request body is the raw
/// file bytes, streamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadParams {
    /// Destination file name. Must not contain directory separators.
    pub name: String,
    /// Declared size in bytes; the server rejects a body that disagrees.
    pub size: u64,
    /// Declared content digest; verified against the staged bytes.
    pub checksum: Checksum,
    /// Optional preferred store name.
    #[serde(default)]
    pub store: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_name: String,
    pub store_name: String,
    /// Path of the committed instance, relative to the store root.
    pub instance_path: String,
    /// True when the name already existed with an identical checksum and
    /// the upload was treated as a no-op.
    #[serde(default)]
    pub already_present: bool,
}
