use serde::{Deserialize, Serialize};

/// `POST /api/v2/files/locate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateFileRequest {
    pub name: String,
}

/// One place a copy of the file is known to live. Exactly one of `store`
/// (local instance) or `librarian` (remote claim) is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub librarian: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateFileResponse {
    pub locations: Vec<FileLocation>,
}

/// `POST /api/v2/instances/delete` — soft delete: the instance is marked
/// unavailable; bytes are removed separately by deletion tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDeleteRequest {
    pub name: String,
    pub store: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDeleteResponse {
    pub marked_unavailable: bool,
}
