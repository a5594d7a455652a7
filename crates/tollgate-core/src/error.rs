//! Error types and result aliases for Tollgate.
//!
//! Errors are structured for programmatic handling: the HTTP layer maps each
//! variant onto a status code without inspecting messages.

/// The result type used throughout Tollgate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in idempotency operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An idempotency key was missing, blank, malformed, or not bound to the session.
    #[error("invalid idempotency key: {message}")]
    InvalidKey {
        /// Description of what made the key invalid.
        message: String,
    },

    /// A record state transition was attempted from the wrong state.
    #[error("invalid idempotency transition for key {key}: {message}")]
    InvalidTransition {
        /// Fingerprint of the key whose record was in the wrong state.
        key: String,
        /// Description of the rejected transition.
        message: String,
    },

    /// The state store backend could not be reached.
    #[error("idempotency store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the backend failure.
        message: String,
    },

    /// Invalid input was provided (configuration or arguments).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid key error with the given message.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates a new store unavailable error with the given message.
    #[must_use]
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same request later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unavailable_is_retryable() {
        assert!(Error::store_unavailable("down").is_retryable());
        assert!(!Error::invalid_key("blank").is_retryable());
    }

    #[test]
    fn store_unavailable_message() {
        let err = Error::store_unavailable("backend down");
        assert_eq!(err.to_string(), "idempotency store unavailable: backend down");
    }
}
