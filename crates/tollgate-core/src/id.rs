//! Strongly-typed identifiers for idempotency keys and sessions.
//!
//! Both identifiers are opaque strings on the wire. Keys are high-entropy
//! tokens (UUID v4, 122 random bits) that the server issues and the client
//! echoes back in the `X-Idempotency-Key` header.
//!
//! # Example
//!
//! ```rust
//! use tollgate_core::id::{IdempotencyKey, SessionId};
//!
//! let key = IdempotencyKey::generate();
//! let parsed: IdempotencyKey = key.as_str().parse().unwrap();
//! assert_eq!(key, parsed);
//!
//! let session = SessionId::generate();
//! assert!(!session.as_str().is_empty());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum accepted length of a client-supplied idempotency key.
pub const MAX_KEY_LEN: usize = 255;

/// Maximum accepted length of a session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Number of leading characters used when a key appears in logs.
const FINGERPRINT_LEN: usize = 8;

/// Token identifying one logical (non-retried) client intent.
///
/// `Debug` prints only a short fingerprint so keys do not leak into logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the key as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix suitable for log fields.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyKey({}…)", self.fingerprint())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_key("key is blank"));
        }
        if trimmed.len() > MAX_KEY_LEN {
            return Err(Error::invalid_key(format!(
                "key exceeds {MAX_KEY_LEN} characters"
            )));
        }
        if !trimmed.chars().all(|c| c.is_ascii_graphic()) {
            return Err(Error::invalid_key(
                "key must contain only visible ASCII characters",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}

/// Opaque identity of a client session, managed outside the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generates a new random session identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the session identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_SESSION_ID_LEN {
            return Err(Error::InvalidInput(format!(
                "session id must be 1..={MAX_SESSION_ID_LEN} characters"
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidInput(
                "session id must be alphanumeric, '-' or '_'".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

/// Returns the first few characters of a token for logging.
#[must_use]
pub fn fingerprint(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(FINGERPRINT_LEN)
        .map_or(token.len(), |(idx, _)| idx);
    &token[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_keys_are_unique() {
        let keys: HashSet<_> = (0..1_000).map(|_| IdempotencyKey::generate()).collect();
        assert_eq!(keys.len(), 1_000);
    }

    #[test]
    fn key_parse_trims_whitespace() {
        let key: IdempotencyKey = "  k1 ".parse().unwrap();
        assert_eq!(key.as_str(), "k1");
    }

    #[test]
    fn key_parse_rejects_blank() {
        assert!(matches!(
            "   ".parse::<IdempotencyKey>(),
            Err(Error::InvalidKey { .. })
        ));
        assert!("".parse::<IdempotencyKey>().is_err());
    }

    #[test]
    fn key_parse_rejects_oversized_and_control_chars() {
        let long = "a".repeat(MAX_KEY_LEN + 1);
        assert!(long.parse::<IdempotencyKey>().is_err());
        assert!("bad key".parse::<IdempotencyKey>().is_err());
        assert!("bad\u{7f}".parse::<IdempotencyKey>().is_err());
    }

    #[test]
    fn key_debug_shows_only_fingerprint() {
        let key: IdempotencyKey = "0123456789abcdef".parse().unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("01234567"));
        assert!(!debug.contains("89abcdef"));
    }

    #[test]
    fn key_try_from_string_validates() {
        assert!(IdempotencyKey::try_from("k-42".to_string()).is_ok());
        assert!(IdempotencyKey::try_from(String::new()).is_err());
    }

    #[test]
    fn session_id_validation() {
        assert!("abc_DEF-123".parse::<SessionId>().is_ok());
        assert!("".parse::<SessionId>().is_err());
        assert!("has space".parse::<SessionId>().is_err());
        assert!("semi;colon".parse::<SessionId>().is_err());
        let generated = SessionId::generate();
        assert!(generated.as_str().parse::<SessionId>().is_ok());
    }

    #[test]
    fn fingerprint_handles_short_tokens() {
        assert_eq!(fingerprint("abc"), "abc");
        assert_eq!(fingerprint("abcdefghijkl"), "abcdefgh");
    }
}
