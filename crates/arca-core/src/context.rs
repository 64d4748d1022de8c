//! Process-wide context handed to handlers and background tasks.

use rusqlite::Connection;

use crate::db::{lock_db, SharedDb};
use crate::encryption::CredentialKey;
use crate::error::Result;

/// Shared handles: the database, the credential key, and this instance's
/// identity. Cloning is cheap; the database is behind an `Arc`.
#[derive(Clone)]
pub struct CoreContext {
    pub db: SharedDb,
    pub keys: CredentialKey,
    /// This instance's configured name, sent as `source` on peer calls.
    pub site_name: String,
}

impl CoreContext {
    pub fn new(db: SharedDb, keys: CredentialKey, site_name: &str) -> Self {
        Self {
            db,
            keys,
            site_name: site_name.to_string(),
        }
    }

    /// Run a read or small write against the shared connection. The guard
    /// is scoped to the closure; never call out to the network inside.
    pub fn with_db<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = lock_db(&self.db);
        f(guard.conn())
    }

    /// Run a multi-statement unit inside a retrying transaction.
    pub fn transaction<T>(
        &self,
        f: impl FnMut(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = lock_db(&self.db);
        guard.transaction(f)
    }
}
