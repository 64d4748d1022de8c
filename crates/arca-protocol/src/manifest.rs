//! The on-device store manifest used for SneakerNet: a store is shipped
//! offline with a manifest file describing its contents, and the receiving
//! instance ingests from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// Manifest format version this build writes.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestItem {
    pub name: String,
    pub size: u64,
    pub checksum: Checksum,
    /// Path relative to the store root on the shipped device.
    pub relative_path: String,
    /// Set when the generating side created an OutgoingTransfer for this
    /// item, so the receiver can drive the usual completion callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing_transfer_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreManifest {
    pub version: u32,
    pub source_librarian: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_librarian: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub store_name: String,
    pub items: Vec<ManifestItem>,
}

impl StoreManifest {
    /// Consumers validate the version; unknown fields elsewhere in the
    /// document are ignored by serde.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != MANIFEST_VERSION {
            return Err(format!(
                "unsupported manifest version {} (expected {MANIFEST_VERSION})",
                self.version
            ));
        }
        Ok(())
    }
}

/// `POST /api/v2/sneakernet/ingest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestManifestRequest {
    pub manifest: StoreManifest,
    /// Local store the shipped device has been mounted as.
    pub store_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedManifestItem {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestManifestResponse {
    pub ingested: Vec<String>,
    pub rejected: Vec<RejectedManifestItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{
            "version": 1,
            "source_librarian": "a",
            "generated_at": "2024-06-01T00:00:00Z",
            "store_name": "vault",
            "items": [],
            "some_future_field": {"x": 1}
        }"#;
        let manifest: StoreManifest = serde_json::from_str(raw).unwrap();
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let manifest = StoreManifest {
            version: 2,
            source_librarian: "a".into(),
            destination_librarian: None,
            generated_at: Utc::now(),
            store_name: "vault".into(),
            items: vec![],
        };
        assert!(manifest.validate().is_err());
    }
}
