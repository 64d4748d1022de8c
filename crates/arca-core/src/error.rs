use thiserror::Error;

use arca_protocol::TransferStatus;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("file '{0}' not found")]
    FileNotFound(String),

    #[error("file '{0}' already exists with a different checksum")]
    FileConflict(String),

    #[error("store '{0}' not found")]
    StoreNotFound(String),

    #[error("librarian '{0}' not found")]
    LibrarianNotFound(String),

    #[error("librarian '{name}' answered a ping as '{reported}'")]
    LibrarianNameMismatch { name: String, reported: String },

    #[error("transfer {0} not found")]
    TransferNotFound(i64),

    #[error("invalid transfer state change {from} -> {to} on transfer {id}")]
    InvalidTransition {
        id: i64,
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("instance {0} has a deletion policy that disallows removal")]
    DeletionDisallowed(i64),

    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("peer call failed: {0}")]
    Peer(#[from] crate::client::ClientError),

    #[error("store error: {0}")]
    Store(#[from] arca_store::StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
