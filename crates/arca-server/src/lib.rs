//! HTTP surface of an arca instance: typed handlers over the core
//! orchestration crate, basic-auth with role levels, and the server
//! bootstrap used by the binary and by integration tests.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod notify;
pub mod state;

use arca_core::{CoreContext, CredentialKey, Database};

use crate::config::ServerConfig;
use crate::notify::Notifier;
use crate::state::ServerState;

/// Wire up state from a loaded configuration: open the database, load the
/// credential key, register stores, bootstrap the admin user.
pub fn build_state(config: ServerConfig) -> Result<ServerState, StartupError> {
    let keys = CredentialKey::load(&config.encryption_key_file)
        .map_err(|e| StartupError::Config(e.to_string()))?;

    let database = Database::open_at(&config.database_name)
        .map_err(|e| StartupError::Database(e.to_string()))?;
    let db = arca_core::shared(database);

    let ctx = CoreContext::new(db, keys, &config.name);
    let notifier = Notifier::from_config(&config).map_err(StartupError::Config)?;

    let state = ServerState::new(config, ctx, notifier);
    let entries = state.config.add_stores.clone();
    state
        .register_stores(&entries)
        .map_err(|e| StartupError::Config(e.to_string()))?;
    state
        .bootstrap_admin()
        .map_err(|e| StartupError::Database(e.to_string()))?;
    Ok(state)
}

/// Startup failures, separated for the documented exit codes:
/// configuration errors exit 2, database errors exit 3, the rest exit 1.
#[derive(Debug)]
pub enum StartupError {
    Config(String),
    Database(String),
    Other(String),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 2,
            StartupError::Database(_) => 3,
            StartupError::Other(_) => 1,
        }
    }
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(m) => write!(f, "configuration error: {m}"),
            StartupError::Database(m) => write!(f, "database error: {m}"),
            StartupError::Other(m) => write!(f, "{m}"),
        }
    }
}
