use serde::{Deserialize, Serialize};

/// `POST /api/v2/ping`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub protocol_version: u32,
}

/// Each side identifies itself by its configured name; callers compare the
/// returned name against their local peer record and refuse the interaction
/// on mismatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub name: String,
    pub description: String,
}
