//! Session-bound idempotency key issuance.
//!
//! Works like an anti-CSRF token: the server issues one key per session, the
//! client echoes it on its next mutating call, and the key is replaced after
//! every successful protected operation so a stale page cannot reuse it for a
//! new, unrelated upload.
//!
//! Each session holds at most one key. Replacing a binding is a single cache
//! write, so a concurrent validator sees either the old key or the new one and
//! never both or neither.

use std::fmt;
use std::time::Duration;

use moka::sync::Cache;
use subtle::ConstantTimeEq;

use crate::id::{IdempotencyKey, SessionId};

/// Default number of sessions tracked at once.
pub const DEFAULT_MAX_SESSIONS: u64 = 100_000;

/// Default idle lifetime of a session binding (30 minutes).
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Issues, refreshes, and validates per-session idempotency keys.
#[derive(Clone)]
pub struct KeyIssuer {
    bindings: Cache<SessionId, IdempotencyKey>,
}

impl fmt::Debug for KeyIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyIssuer")
            .field("sessions", &self.bindings.entry_count())
            .finish()
    }
}

impl Default for KeyIssuer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_IDLE_TIMEOUT)
    }
}

impl KeyIssuer {
    /// Creates an issuer bounded to `max_sessions` bindings that expire after
    /// `idle_timeout` without access.
    #[must_use]
    pub fn new(max_sessions: u64, idle_timeout: Duration) -> Self {
        let bindings = Cache::builder()
            .name("idempotency-session-keys")
            .max_capacity(max_sessions)
            .time_to_idle(idle_timeout)
            .build();
        Self { bindings }
    }

    /// Returns the session's key, generating and binding one if absent.
    ///
    /// Repeated calls for an un-refreshed session return the same key.
    #[must_use]
    pub fn issue(&self, session: &SessionId) -> IdempotencyKey {
        self.bindings
            .entry(session.clone())
            .or_insert_with(IdempotencyKey::generate)
            .into_value()
    }

    /// Replaces the session's key with a freshly generated one.
    #[must_use]
    pub fn refresh(&self, session: &SessionId) -> IdempotencyKey {
        let key = IdempotencyKey::generate();
        self.bindings.insert(session.clone(), key.clone());
        tracing::debug!(session = %session, key = ?key, "Refreshed idempotency key");
        key
    }

    /// Returns true iff `key` is the session's current key.
    ///
    /// Blank keys and unbound sessions never validate. The comparison runs in
    /// constant time with respect to key contents.
    #[must_use]
    pub fn validate(&self, key: &str, session: &SessionId) -> bool {
        let key = key.trim();
        if key.is_empty() {
            return false;
        }
        self.bindings.get(session).is_some_and(|bound| {
            bool::from(bound.as_str().as_bytes().ct_eq(key.as_bytes()))
        })
    }

    /// Clears the session's binding.
    pub fn invalidate(&self, session: &SessionId) {
        self.bindings.invalidate(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(raw: &str) -> SessionId {
        raw.parse().unwrap()
    }

    #[test]
    fn issue_is_stable_until_refresh() {
        let issuer = KeyIssuer::default();
        let s = session("s1");
        let first = issuer.issue(&s);
        assert_eq!(issuer.issue(&s), first);

        let refreshed = issuer.refresh(&s);
        assert_ne!(refreshed, first);
        assert_eq!(issuer.issue(&s), refreshed);
    }

    #[test]
    fn distinct_sessions_get_distinct_keys() {
        let issuer = KeyIssuer::default();
        assert_ne!(issuer.issue(&session("a")), issuer.issue(&session("b")));
    }

    #[test]
    fn validate_matches_only_current_key() {
        let issuer = KeyIssuer::default();
        let s = session("s2");
        let old = issuer.issue(&s);
        assert!(issuer.validate(old.as_str(), &s));

        let new = issuer.refresh(&s);
        assert!(!issuer.validate(old.as_str(), &s));
        assert!(issuer.validate(new.as_str(), &s));
    }

    #[test]
    fn validate_rejects_blank_and_unbound() {
        let issuer = KeyIssuer::default();
        let s = session("s3");
        assert!(!issuer.validate("anything", &s));

        let _ = issuer.issue(&s);
        assert!(!issuer.validate("", &s));
        assert!(!issuer.validate("   ", &s));
    }

    #[test]
    fn validate_is_bound_to_session() {
        let issuer = KeyIssuer::default();
        let key = issuer.issue(&session("owner"));
        let _ = issuer.issue(&session("other"));
        assert!(!issuer.validate(key.as_str(), &session("other")));
    }

    #[test]
    fn invalidate_clears_binding() {
        let issuer = KeyIssuer::default();
        let s = session("s4");
        let key = issuer.issue(&s);
        issuer.invalidate(&s);
        assert!(!issuer.validate(key.as_str(), &s));
        assert_ne!(issuer.issue(&s), key);
    }

    #[test]
    fn refresh_without_prior_key_binds_new_key() {
        let issuer = KeyIssuer::default();
        let s = session("s5");
        let key = issuer.refresh(&s);
        assert!(issuer.validate(key.as_str(), &s));
        assert_eq!(issuer.issue(&s), key);
    }
}
