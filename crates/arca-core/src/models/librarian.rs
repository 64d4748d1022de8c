//! Known peer instances ("librarians") and their encrypted credentials.
//! The row owns the ciphertext; plaintext is reconstructed only when a
//! client is built, and dropped with it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::client::PeerClient;
use crate::db::{from_sql_time, to_sql_time};
use crate::encryption::CredentialKey;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct Librarian {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub port: u16,
    /// AES-256-GCM ciphertext of the `username:password` authenticator.
    pub authenticator: String,
    pub transfers_enabled: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Librarian {
    const COLUMNS: &'static str =
        "id, name, url, port, authenticator, transfers_enabled, last_seen, last_error";

    /// Register a peer, encrypting the plaintext authenticator before it
    /// touches the database.
    pub fn create(
        conn: &Connection,
        keys: &CredentialKey,
        name: &str,
        url: &str,
        port: u16,
        plaintext_authenticator: &str,
    ) -> Result<Librarian> {
        let encrypted = keys.encrypt_string(plaintext_authenticator)?;
        conn.execute(
            "INSERT INTO librarians (name, url, port, authenticator) VALUES (?1, ?2, ?3, ?4)",
            params![name, url, port as i64, encrypted],
        )?;
        Ok(Librarian {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            url: url.to_string(),
            port,
            authenticator: encrypted,
            transfers_enabled: true,
            last_seen: None,
            last_error: None,
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Librarian> {
        let last_seen: Option<String> = row.get("last_seen")?;
        Ok(Librarian {
            id: row.get("id")?,
            name: row.get("name")?,
            url: row.get("url")?,
            port: row.get::<_, i64>("port")? as u16,
            authenticator: row.get("authenticator")?,
            transfers_enabled: row.get::<_, i64>("transfers_enabled")? != 0,
            last_seen: last_seen.as_deref().and_then(|s| from_sql_time(s).ok()),
            last_error: row.get("last_error")?,
        })
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<Librarian>> {
        conn.query_row(
            &format!("SELECT {} FROM librarians WHERE name = ?1", Self::COLUMNS),
            params![name],
            Librarian::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Option<Librarian>> {
        conn.query_row(
            &format!("SELECT {} FROM librarians WHERE id = ?1", Self::COLUMNS),
            params![id],
            Librarian::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn all(conn: &Connection) -> Result<Vec<Librarian>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM librarians ORDER BY name", Self::COLUMNS))?;
        let rows = stmt.query_map([], Librarian::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn set_transfer_enabled(&self, conn: &Connection, enabled: bool) -> Result<()> {
        conn.execute(
            "UPDATE librarians SET transfers_enabled = ?1 WHERE id = ?2",
            params![enabled as i64, self.id],
        )?;
        Ok(())
    }

    pub fn remove(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "DELETE FROM remote_instances WHERE librarian_id = ?1",
            params![self.id],
        )?;
        conn.execute("DELETE FROM librarians WHERE id = ?1", params![self.id])?;
        Ok(())
    }

    /// Build an authenticated client. Decrypts the stored authenticator;
    /// the plaintext lives only inside the returned client.
    pub fn client(&self, keys: &CredentialKey) -> Result<PeerClient> {
        let plaintext = keys.decrypt_string(&self.authenticator)?;
        Ok(PeerClient::from_authenticator(&self.url, self.port, &plaintext))
    }

    pub fn record_seen(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE librarians SET last_seen = ?1, last_error = NULL WHERE id = ?2",
            params![to_sql_time(Utc::now()), self.id],
        )?;
        Ok(())
    }

    /// Record a failed interaction; orchestration skips the peer for the
    /// rest of its cycle.
    pub fn record_error(&self, conn: &Connection, error: &str) -> Result<()> {
        conn.execute(
            "UPDATE librarians SET last_error = ?1 WHERE id = ?2",
            params![error, self.id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn key() -> CredentialKey {
        CredentialKey::from_hex(&"11".repeat(32)).unwrap()
    }

    #[test]
    fn authenticator_is_never_stored_in_plaintext() {
        let db = Database::open_in_memory().unwrap();
        let keys = key();
        let peer = Librarian::create(
            db.conn(),
            &keys,
            "peer-b",
            "http://peer-b.example",
            8080,
            "bot:secret",
        )
        .unwrap();

        assert!(!peer.authenticator.contains("secret"));
        let stored: String = db
            .conn()
            .query_row("SELECT authenticator FROM librarians WHERE id = ?1", [peer.id], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(!stored.contains("secret"));

        // But the client can still reconstruct it.
        assert!(peer.client(&keys).is_ok());
    }

    #[test]
    fn transfer_toggle_and_error_tracking() {
        let db = Database::open_in_memory().unwrap();
        let peer = Librarian::create(db.conn(), &key(), "p", "http://p", 80, "a:b").unwrap();

        peer.set_transfer_enabled(db.conn(), false).unwrap();
        let reloaded = Librarian::get_by_name(db.conn(), "p").unwrap().unwrap();
        assert!(!reloaded.transfers_enabled);

        peer.record_error(db.conn(), "ping failed").unwrap();
        let reloaded = Librarian::get_by_name(db.conn(), "p").unwrap().unwrap();
        assert_eq!(reloaded.last_error.as_deref(), Some("ping failed"));

        peer.record_seen(db.conn()).unwrap();
        let reloaded = Librarian::get_by_name(db.conn(), "p").unwrap().unwrap();
        assert!(reloaded.last_seen.is_some());
        assert!(reloaded.last_error.is_none());
    }

    #[test]
    fn peer_names_are_unique() {
        let db = Database::open_in_memory().unwrap();
        Librarian::create(db.conn(), &key(), "p", "http://p", 80, "a:b").unwrap();
        assert!(Librarian::create(db.conn(), &key(), "p", "http://q", 81, "a:b").is_err());
    }
}
