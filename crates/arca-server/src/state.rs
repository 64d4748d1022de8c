//! Shared application state, cloned into every handler.

use arca_core::models::{StoreRow, User};
use arca_core::{CoreContext, CoreError};
use arca_protocol::AuthLevel;

use crate::config::{ServerConfig, StoreConfigEntry};
use crate::notify::Notifier;

#[derive(Clone)]
pub struct ServerState {
    pub config: std::sync::Arc<ServerConfig>,
    pub ctx: CoreContext,
    pub notifier: std::sync::Arc<Notifier>,
}

impl ServerState {
    pub fn new(config: ServerConfig, ctx: CoreContext, notifier: Notifier) -> Self {
        Self {
            config: std::sync::Arc::new(config),
            ctx,
            notifier: std::sync::Arc::new(notifier),
        }
    }

    /// Register configured stores that are not in the database yet.
    /// Existing rows keep their runtime flags (an operator's disable
    /// survives restarts).
    pub fn register_stores(&self, entries: &[StoreConfigEntry]) -> Result<(), CoreError> {
        self.ctx.with_db(|conn| {
            for entry in entries {
                if StoreRow::get_by_name(conn, &entry.store_name)?.is_some() {
                    continue;
                }
                let row = StoreRow::create(
                    conn,
                    &entry.store_name,
                    &entry.store_type,
                    entry.ingestible,
                    &entry.store_data,
                    &entry.transfer_manager_data,
                    &entry.asynchronous_transfer_manager_data,
                )?;
                // Fail startup loudly when the driver config is bad.
                row.driver()?;
                tracing::info!(store = %entry.store_name, "registered store");
            }
            Ok(())
        })
    }

    /// First-run bootstrap: create an admin account when the user table is
    /// empty and a password was supplied via `ARCA_ADMIN_PASSWORD`.
    pub fn bootstrap_admin(&self) -> Result<(), CoreError> {
        let Ok(password) = std::env::var("ARCA_ADMIN_PASSWORD") else {
            return Ok(());
        };
        self.ctx.with_db(|conn| {
            if User::count(conn)? == 0 {
                User::create(conn, "admin", &password, AuthLevel::Admin)?;
                tracing::info!("created bootstrap admin user");
            }
            Ok(())
        })
    }
}
