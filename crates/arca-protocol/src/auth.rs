use std::fmt;

use serde::{Deserialize, Serialize};

/// The level of authorisation a user holds.
///
/// Levels form a total order; every endpoint declares a minimum level and a
/// caller passes if their level is `>=` that minimum. `Admin` sits above
/// everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthLevel {
    /// May only call endpoints with no minimum (e.g. `ping`).
    None,
    /// May read metadata and search, but not write.
    ReadOnly,
    /// May read, and may deliver transfer callbacks.
    Callback,
    /// May read and append (upload, stage clones).
    ReadAppend,
    /// May read, append, and delete.
    ReadWrite,
    /// Unrestricted, including configuration changes.
    Admin,
}

impl AuthLevel {
    /// Stable integer encoding used in the database.
    pub fn as_i64(self) -> i64 {
        match self {
            AuthLevel::None => 0,
            AuthLevel::ReadOnly => 1,
            AuthLevel::Callback => 2,
            AuthLevel::ReadAppend => 3,
            AuthLevel::ReadWrite => 4,
            AuthLevel::Admin => 100,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(AuthLevel::None),
            1 => Some(AuthLevel::ReadOnly),
            2 => Some(AuthLevel::Callback),
            3 => Some(AuthLevel::ReadAppend),
            4 => Some(AuthLevel::ReadWrite),
            100 => Some(AuthLevel::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthLevel::None => "none",
            AuthLevel::ReadOnly => "readonly",
            AuthLevel::Callback => "callback",
            AuthLevel::ReadAppend => "readappend",
            AuthLevel::ReadWrite => "readwrite",
            AuthLevel::Admin => "admin",
        };
        f.write_str(name)
    }
}
