//! Server configuration, deserialized from a YAML file at startup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// This instance's name: the identity peers verify over ping.
    pub name: String,

    #[serde(default = "default_site_name")]
    pub displayed_site_name: String,
    #[serde(default)]
    pub displayed_site_description: String,

    /// Bind target.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Persistence. `sqlite` is the reference driver; `database_name` is
    /// the file path. The user/password/host/port keys are accepted so
    /// configs written for networked drivers still parse.
    #[serde(default = "default_database_driver")]
    pub database_driver: String,
    pub database_name: PathBuf,
    #[serde(default)]
    pub database_user: Option<String>,
    #[serde(default)]
    pub database_password: Option<String>,
    #[serde(default)]
    pub database_host: Option<String>,
    #[serde(default)]
    pub database_port: Option<u16>,

    /// Symmetric key for peer credentials (64 hex chars in a file).
    pub encryption_key_file: PathBuf,

    /// Non-admin search result cap.
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,

    /// Per-upload ceiling in bytes.
    #[serde(default = "default_max_upload")]
    pub maximal_upload_size_bytes: u64,

    /// Stores registered at startup (existing rows are left untouched).
    #[serde(default)]
    pub add_stores: Vec<StoreConfigEntry>,

    /// Log output format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Observability: forward selected error rows to a Slack webhook.
    #[serde(default)]
    pub slack_webhook_enable: bool,
    #[serde(default)]
    pub slack_webhook_url_file: Option<PathBuf>,
    #[serde(default)]
    pub slack_webhook_post_error_severity: Vec<String>,
    #[serde(default)]
    pub slack_webhook_post_error_category: Vec<String>,

    /// Background task configuration (JSON document, §tasks). Falls back
    /// to the `ARCA_BACKGROUND_CONFIG` environment variable.
    #[serde(default)]
    pub background_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfigEntry {
    pub store_name: String,
    pub store_type: String,
    #[serde(default = "default_true")]
    pub ingestible: bool,
    pub store_data: serde_json::Value,
    #[serde(default = "default_json_object")]
    pub transfer_manager_data: serde_json::Value,
    #[serde(default = "default_json_object")]
    pub asynchronous_transfer_manager_data: serde_json::Value,
}

fn default_site_name() -> String {
    "arca".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    21100
}

fn default_database_driver() -> String {
    "sqlite".to_string()
}

fn default_max_search_results() -> usize {
    64
}

fn default_max_upload() -> u64 {
    // 100 GiB; primary-data files are large.
    100 * 1024 * 1024 * 1024
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

fn default_json_object() -> serde_json::Value {
    serde_json::json!({})
}

impl ServerConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config '{}': {e}", path.display()))?;
        let config: ServerConfig =
            serde_yaml::from_str(&raw).map_err(|e| format!("cannot parse config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("'name' must not be empty".into());
        }
        if self.database_driver != "sqlite" {
            return Err(format!(
                "unsupported database_driver '{}' (this build supports 'sqlite')",
                self.database_driver
            ));
        }
        if self.slack_webhook_enable && self.slack_webhook_url_file.is_none() {
            return Err("slack_webhook_enable requires slack_webhook_url_file".into());
        }
        Ok(())
    }
}
