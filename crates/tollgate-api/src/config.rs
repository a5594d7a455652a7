//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use tollgate_core::issuer::{DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_IDLE_TIMEOUT};
use tollgate_core::store::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL, StoreConfig};
use tollgate_core::{Error, Result};

/// Upper bound on record lifetime (7 days).
pub const MAX_IDEMPOTENCY_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Default multipart upload limit (10 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Path prefix protected when nothing else is configured.
pub const DEFAULT_PROTECTED_PREFIX: &str = "/api/p2p/upload";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP port to listen on.
    pub http_port: u16,

    /// Enable debug mode (pretty logs, permissive CORS allowed).
    pub debug: bool,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Idempotency gate configuration.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Session key binding configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Maximum accepted request body for uploads.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// What the gate does with a protected request that carries no key.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    /// Reject with 400.
    #[default]
    Required,
    /// Forward without protection (at-least-once for that call).
    Optional,
}

/// Idempotency gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Record lifetime in seconds, regardless of status.
    pub ttl_secs: u64,
    /// Maximum number of records held at once.
    pub max_entries: u64,
    /// Request path prefixes the gate protects.
    pub protected_prefixes: Vec<String>,
    /// Missing-key handling on protected paths.
    pub key_policy: KeyPolicy,
    /// Validate keys against the session and scope records per session.
    pub bind_to_session: bool,
    /// `Retry-After` value on 409 responses.
    pub retry_after_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL.as_secs(),
            max_entries: DEFAULT_MAX_ENTRIES,
            protected_prefixes: vec![DEFAULT_PROTECTED_PREFIX.to_string()],
            key_policy: KeyPolicy::Required,
            bind_to_session: true,
            retry_after_secs: 1,
        }
    }
}

impl IdempotencyConfig {
    /// Returns the store bounds described by this configuration.
    #[must_use]
    pub const fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_entries: self.max_entries,
            ttl: Duration::from_secs(self.ttl_secs),
        }
    }

    /// Validates bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if the TTL is outside `1..=7 days`, capacity is zero,
    /// or a protected prefix does not start with `/`.
    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 || self.ttl_secs > MAX_IDEMPOTENCY_TTL_SECS {
            return Err(Error::InvalidInput(format!(
                "idempotency ttl_secs must be between 1 and {MAX_IDEMPOTENCY_TTL_SECS}"
            )));
        }
        self.store_config().validate()?;
        if let Some(prefix) = self
            .protected_prefixes
            .iter()
            .find(|prefix| !prefix.starts_with('/'))
        {
            return Err(Error::InvalidInput(format!(
                "protected prefix must start with '/': {prefix}"
            )));
        }
        Ok(())
    }
}

/// Session key binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds a session binding survives without access.
    pub idle_timeout_secs: u64,
    /// Maximum number of sessions tracked at once.
    pub max_sessions: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_SESSION_IDLE_TIMEOUT.as_secs(),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl SessionConfig {
    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Use `["*"]` to allow all origins (development only).
    /// Empty list disables CORS entirely.
    pub allowed_origins: Vec<String>,

    /// Max age for preflight cache (seconds).
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_age_seconds: 3600, // 1 hour
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            cors: CorsConfig::default(),
            idempotency: IdempotencyConfig::default(),
            session: SessionConfig::default(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

const fn default_max_upload_bytes() -> usize {
    DEFAULT_MAX_UPLOAD_BYTES
}

impl Config {
    /// Loads configuration from `TOLLGATE_*` environment variables on top of
    /// the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the offending variable.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("TOLLGATE_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("TOLLGATE_DEBUG")? {
            config.debug = debug;
        }

        if let Some(origins) = env_string("TOLLGATE_CORS_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = parse_cors_allowed_origins(&origins);
        }
        if let Some(max_age) = env_u64("TOLLGATE_CORS_MAX_AGE_SECONDS")? {
            config.cors.max_age_seconds = max_age;
        }

        if let Some(ttl) = env_u64("TOLLGATE_IDEMPOTENCY_TTL_SECS")? {
            config.idempotency.ttl_secs = ttl;
        }
        if let Some(max_entries) = env_u64("TOLLGATE_IDEMPOTENCY_MAX_ENTRIES")? {
            config.idempotency.max_entries = max_entries;
        }
        if let Some(prefixes) = env_string("TOLLGATE_IDEMPOTENCY_PROTECTED_PREFIXES") {
            config.idempotency.protected_prefixes = parse_list(&prefixes);
        }
        if let Some(policy) = env_string("TOLLGATE_IDEMPOTENCY_KEY_POLICY") {
            config.idempotency.key_policy =
                parse_key_policy("TOLLGATE_IDEMPOTENCY_KEY_POLICY", &policy)?;
        }
        if let Some(bind) = env_bool("TOLLGATE_IDEMPOTENCY_BIND_TO_SESSION")? {
            config.idempotency.bind_to_session = bind;
        }
        if let Some(secs) = env_u64("TOLLGATE_IDEMPOTENCY_RETRY_AFTER_SECS")? {
            config.idempotency.retry_after_secs = secs;
        }

        if let Some(idle) = env_u64("TOLLGATE_SESSION_IDLE_TIMEOUT_SECS")? {
            config.session.idle_timeout_secs = idle;
        }
        if let Some(max_sessions) = env_u64("TOLLGATE_SESSION_MAX_SESSIONS")? {
            config.session.max_sessions = max_sessions;
        }

        if let Some(limit) = env_usize("TOLLGATE_MAX_UPLOAD_BYTES")? {
            config.max_upload_bytes = limit;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error when any bound is out of range.
    pub fn validate(&self) -> Result<()> {
        self.idempotency.validate()?;
        if self.session.idle_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "session idle_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.max_sessions == 0 {
            return Err(Error::InvalidInput(
                "session max_sessions must be greater than 0".to_string(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(Error::InvalidInput(
                "max_upload_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_key_policy(name: &str, value: &str) -> Result<KeyPolicy> {
    let policy = value.trim().to_ascii_lowercase();
    match policy.as_str() {
        "required" => Ok(KeyPolicy::Required),
        "optional" => Ok(KeyPolicy::Optional),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be one of: required, optional (got {value})"
        ))),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_cors_allowed_origins(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed == "*" {
        return vec!["*".to_string()];
    }
    parse_list(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.http_port, 8080);
        assert!(!config.debug);
        assert_eq!(config.idempotency.ttl_secs, 7200);
        assert_eq!(config.idempotency.max_entries, 10_000);
        assert_eq!(config.idempotency.protected_prefixes, vec!["/api/p2p/upload"]);
        assert_eq!(config.idempotency.key_policy, KeyPolicy::Required);
        assert!(config.idempotency.bind_to_session);
        assert_eq!(config.session.idle_timeout_secs, 1800);
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn store_config_uses_ttl_and_capacity() {
        let idempotency = IdempotencyConfig {
            ttl_secs: 30,
            max_entries: 5,
            ..IdempotencyConfig::default()
        };
        let store = idempotency.store_config();
        assert_eq!(store.ttl, Duration::from_secs(30));
        assert_eq!(store.max_entries, 5);
    }

    #[test]
    fn ttl_bounds_are_enforced() {
        let zero = IdempotencyConfig {
            ttl_secs: 0,
            ..IdempotencyConfig::default()
        };
        assert!(matches!(zero.validate(), Err(Error::InvalidInput(_))));

        let too_long = IdempotencyConfig {
            ttl_secs: MAX_IDEMPOTENCY_TTL_SECS + 1,
            ..IdempotencyConfig::default()
        };
        assert!(too_long.validate().is_err());

        let max = IdempotencyConfig {
            ttl_secs: MAX_IDEMPOTENCY_TTL_SECS,
            ..IdempotencyConfig::default()
        };
        assert!(max.validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = IdempotencyConfig {
            max_entries: 0,
            ..IdempotencyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_prefix_rejected() {
        let config = IdempotencyConfig {
            protected_prefixes: vec!["api/upload".to_string()],
            ..IdempotencyConfig::default()
        };
        let err = config.validate().unwrap_err();
        let Error::InvalidInput(message) = err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(message.contains("api/upload"));
    }

    #[test]
    fn parse_bool_accepts_true_values() {
        assert!(parse_bool("TEST", "true").unwrap());
        assert!(parse_bool("TEST", "1").unwrap());
        assert!(parse_bool("TEST", "yes").unwrap());
        assert!(parse_bool("TEST", "TRUE").unwrap());
    }

    #[test]
    fn parse_bool_rejects_invalid_values() {
        assert!(parse_bool("TEST", "maybe").is_err());
        assert!(parse_bool("TEST", "").is_err());
    }

    #[test]
    fn parse_key_policy_accepts_both_modes() -> Result<()> {
        assert_eq!(parse_key_policy("TEST", "required")?, KeyPolicy::Required);
        assert_eq!(parse_key_policy("TEST", " Optional ")?, KeyPolicy::Optional);
        Ok(())
    }

    #[test]
    fn parse_key_policy_names_variable_on_error() {
        let err = parse_key_policy("TOLLGATE_IDEMPOTENCY_KEY_POLICY", "lenient").unwrap_err();
        let Error::InvalidInput(message) = err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(message.contains("TOLLGATE_IDEMPOTENCY_KEY_POLICY"));
        assert!(message.contains("lenient"));
    }

    #[test]
    fn parse_list_trims_and_skips_blanks() {
        assert_eq!(
            parse_list(" /api/p2p/upload , ,/api/files "),
            vec!["/api/p2p/upload", "/api/files"]
        );
    }

    #[test]
    fn cors_origins_wildcard_and_list() {
        assert_eq!(parse_cors_allowed_origins("*"), vec!["*"]);
        assert!(parse_cors_allowed_origins("  ").is_empty());
        assert_eq!(
            parse_cors_allowed_origins("https://a.example, https://b.example"),
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn key_policy_serializes_lowercase() {
        let json = serde_json::to_string(&KeyPolicy::Optional).unwrap();
        assert_eq!(json, "\"optional\"");
    }
}
