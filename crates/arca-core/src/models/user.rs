//! User accounts. Passwords are stored as Argon2id PHC strings.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rusqlite::{params, Connection, OptionalExtension};

use arca_protocol::AuthLevel;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub auth_level: AuthLevel,
}

impl User {
    pub fn create(
        conn: &Connection,
        username: &str,
        password: &str,
        auth_level: AuthLevel,
    ) -> Result<User> {
        if username.is_empty() || username.contains(':') {
            return Err(CoreError::Config(format!("invalid username '{username}'")));
        }
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| CoreError::Credential(format!("password hashing failed: {e}")))?
            .to_string();

        conn.execute(
            "INSERT INTO users (username, password_hash, auth_level) VALUES (?1, ?2, ?3)",
            params![username, password_hash, auth_level.as_i64()],
        )?;
        Ok(User {
            username: username.to_string(),
            password_hash,
            auth_level,
        })
    }

    pub fn get(conn: &Connection, username: &str) -> Result<Option<User>> {
        conn.query_row(
            "SELECT username, password_hash, auth_level FROM users WHERE username = ?1",
            params![username],
            |row| {
                let level: i64 = row.get("auth_level")?;
                Ok(User {
                    username: row.get("username")?,
                    password_hash: row.get("password_hash")?,
                    auth_level: AuthLevel::from_i64(level).unwrap_or(AuthLevel::None),
                })
            },
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn delete(conn: &Connection, username: &str) -> Result<bool> {
        let changed = conn.execute("DELETE FROM users WHERE username = ?1", params![username])?;
        Ok(changed > 0)
    }

    pub fn count(conn: &Connection) -> Result<i64> {
        conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .map_err(CoreError::from)
    }

    /// Verify a password; `None` for unknown users or wrong passwords
    /// (indistinguishable to the caller).
    pub fn authenticate(
        conn: &Connection,
        username: &str,
        password: &str,
    ) -> Result<Option<User>> {
        let Some(user) = Self::get(conn, username)? else {
            return Ok(None);
        };
        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| CoreError::Credential(format!("stored hash is malformed: {e}")))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
        {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn create_authenticate_round_trip() {
        let db = Database::open_in_memory().unwrap();
        User::create(db.conn(), "alice", "hunter2", AuthLevel::ReadAppend).unwrap();

        let user = User::authenticate(db.conn(), "alice", "hunter2")
            .unwrap()
            .unwrap();
        assert_eq!(user.auth_level, AuthLevel::ReadAppend);

        assert!(User::authenticate(db.conn(), "alice", "wrong").unwrap().is_none());
        assert!(User::authenticate(db.conn(), "bob", "hunter2").unwrap().is_none());
    }

    #[test]
    fn password_is_not_stored_verbatim() {
        let db = Database::open_in_memory().unwrap();
        let user = User::create(db.conn(), "alice", "hunter2", AuthLevel::ReadOnly).unwrap();
        assert!(user.password_hash.starts_with("$argon2"));
        assert!(!user.password_hash.contains("hunter2"));
    }

    #[test]
    fn usernames_with_colons_rejected() {
        // Colons would break the basic-auth framing.
        let db = Database::open_in_memory().unwrap();
        assert!(User::create(db.conn(), "a:b", "pw", AuthLevel::None).is_err());
    }

    #[test]
    fn delete_reports_whether_user_existed() {
        let db = Database::open_in_memory().unwrap();
        User::create(db.conn(), "alice", "pw", AuthLevel::Admin).unwrap();
        assert!(User::delete(db.conn(), "alice").unwrap());
        assert!(!User::delete(db.conn(), "alice").unwrap());
    }
}
