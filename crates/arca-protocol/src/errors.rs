use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a persisted error row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSeverity::Info => "info",
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Critical => "critical",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "info" => Some(ErrorSeverity::Info),
            "warning" => Some(ErrorSeverity::Warning),
            "error" => Some(ErrorSeverity::Error),
            "critical" => Some(ErrorSeverity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a persisted error row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Storage device problems: full, unreachable, commit hash mismatch.
    Store,
    /// Async transport and callback delivery problems.
    Transport,
    /// A peer returned an unexpected structure or failed a name check.
    Peer,
    /// Data integrity: checksum mismatches found after the fact.
    Integrity,
    /// Bad or inconsistent configuration.
    Configuration,
    /// Everything that indicates a bug on our side.
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Store => "store",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Peer => "peer",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Internal => "internal",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "store" => Some(ErrorCategory::Store),
            "transport" => Some(ErrorCategory::Transport),
            "peer" => Some(ErrorCategory::Peer),
            "integrity" => Some(ErrorCategory::Integrity),
            "configuration" => Some(ErrorCategory::Configuration),
            "internal" => Some(ErrorCategory::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The small fixed set of failure kinds surfaced to client libraries.
/// Each maps to one HTTP-equivalent status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    AuthenticationFailed,
    NotFound,
    Conflict,
    StoreFull,
    TransportUnavailable,
    InternalError,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::AuthenticationFailed => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::StoreFull => 507,
            ErrorKind::TransportUnavailable => 502,
            ErrorKind::InternalError => 500,
        }
    }
}

/// The body returned for any failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub reason: String,
    /// A human hint at what to do about it, when we have one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_remedy: Option<String>,
}
