use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is disabled")]
    Disabled,

    #[error("store does not accept fresh ingests")]
    NotIngestible,

    #[error("store is not reachable at its configured root")]
    Unavailable,

    #[error("not enough space: need {needed} bytes, {available} available")]
    NotEnoughSpace { needed: u64, available: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("commit target '{0}' already exists")]
    TargetExists(String),

    #[error("unsafe store path '{0}'")]
    UnsafePath(String),

    #[error("staged entry not found at '{0}'")]
    StagedEntryMissing(String),

    #[error("unsupported store type: '{0}'")]
    UnsupportedStoreType(String),

    #[error("unsupported transfer manager: '{0}'")]
    UnsupportedTransferManager(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
