use std::fmt;

use serde::{Deserialize, Serialize};

/// A fixed-width content digest, carried as lowercase hex.
///
/// The reference digest is MD5 (32 hex chars). Comparison is
/// case-insensitive so digests recorded by older tooling still match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

/// Hex length of an MD5 digest.
pub const MD5_HEX_LEN: usize = 32;

impl Checksum {
    /// Parse a hex digest string. Rejects non-hex characters and digests
    /// that are not a whole number of bytes.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.is_empty() || s.len() % 2 != 0 {
            return Err(format!("checksum '{s}' has invalid length {}", s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("checksum '{s}' contains non-hex characters"));
        }
        Ok(Checksum(s.to_ascii_lowercase()))
    }

    /// Wrap an already-lowercase digest produced by a local hasher.
    pub fn from_digest_bytes(bytes: &[u8]) -> Self {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            use fmt::Write;
            let _ = write!(out, "{b:02x}");
        }
        Checksum(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive digest equality.
    pub fn matches(&self, other: &Checksum) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalises_case() {
        let a = Checksum::parse("440D5758B601BE7FBEE75AE3D41C7262").unwrap();
        let b = Checksum::parse("440d5758b601be7fbee75ae3d41c7262").unwrap();
        assert_eq!(a, b);
        assert!(a.matches(&b));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Checksum::parse("").is_err());
        assert!(Checksum::parse("xyz").is_err());
        assert!(Checksum::parse("abc").is_err()); // odd length
    }

    #[test]
    fn digest_bytes_round_trip() {
        let c = Checksum::from_digest_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(c.as_str(), "deadbeef");
        assert_eq!(c, Checksum::parse("DEADBEEF").unwrap());
    }
}
