use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// `POST /api/v2/search/files` — flat filter record. All present filters
/// are ANDed together; absent filters match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSearchRequest {
    /// Exact name match.
    #[serde(default)]
    pub name: Option<String>,
    /// Substring ("like") match on the name.
    #[serde(default)]
    pub name_like: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Inclusive lower bound on creation time.
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time.
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    /// Inclusive size range, bytes.
    #[serde(default)]
    pub min_size: Option<u64>,
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Caller-requested cap; the server clamps this to its configured
    /// maximum for non-admin users.
    #[serde(default)]
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub id: i64,
    pub store_name: String,
    pub path: String,
    pub available: bool,
    pub created_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInstanceDescriptor {
    pub librarian_name: String,
    pub copy_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub checksum: Checksum,
    pub create_time: DateTime<Utc>,
    pub uploader: String,
    pub source: String,
    pub instances: Vec<InstanceDescriptor>,
    pub remote_instances: Vec<RemoteInstanceDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSearchResponse {
    pub results: Vec<FileDescriptor>,
}
