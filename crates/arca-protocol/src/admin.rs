use serde::{Deserialize, Serialize};

use crate::auth::AuthLevel;

/// `POST /api/v2/users/create`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCreateRequest {
    pub username: String,
    pub password: String,
    pub auth_level: AuthLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCreateResponse {
    pub username: String,
}

/// `POST /api/v2/users/delete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDeleteRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDeleteResponse {
    pub deleted: bool,
}

/// `POST /api/v2/admin/librarians/add`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarianAddRequest {
    pub name: String,
    pub url: String,
    pub port: u16,
    /// Plaintext `username:password` used to authenticate against the
    /// peer; encrypted at rest on arrival, never stored as given.
    pub authenticator: String,
    #[serde(default)]
    pub check_connection: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarianAddResponse {
    pub name: String,
    /// Set when `check_connection` ran a ping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_ok: Option<bool>,
}

/// `POST /api/v2/admin/librarians/remove`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarianRemoveRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarianRemoveResponse {
    pub removed: bool,
}

/// `POST /api/v2/admin/librarians/set_transfer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarianTransferRequest {
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarianTransferResponse {
    pub name: String,
    pub enabled: bool,
}

/// `POST /api/v2/admin/stores/set_state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStateRequest {
    pub name: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub ingestible: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStateResponse {
    pub name: String,
    pub enabled: bool,
    pub ingestible: bool,
}

/// `POST /api/v2/admin/stores/manifest` — generate a store manifest for
/// SneakerNet, with optional side effects on the local records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreManifestRequest {
    pub store_name: String,
    /// Create STAGED OutgoingTransfers for every item, addressed to
    /// `destination_librarian`, so the receiving side can run the normal
    /// completion callbacks.
    #[serde(default)]
    pub create_outgoing_transfers: bool,
    #[serde(default)]
    pub destination_librarian: Option<String>,
    /// Disable the store after generating (the device is about to be
    /// physically removed).
    #[serde(default)]
    pub disable_store: bool,
    #[serde(default)]
    pub mark_local_instances_as_unavailable: bool,
}
