//! Idempotency state store.
//!
//! The store maps a [`RecordKey`] to an [`IdempotencyRecord`] and exposes the
//! three transitions the gate relies on:
//!
//! ```text
//!   NOT_FOUND ──begin_if_absent──▶ PROCESSING ──complete──▶ COMPLETED
//!       ▲                              │
//!       └────────────fail──────────────┘
//! ```
//!
//! `COMPLETED` records are immutable until they are evicted. Every transition
//! is a single per-key atomic operation on the underlying cache; there is no
//! read-then-write path and no store-wide lock.
//!
//! ## Eviction
//!
//! [`MemoryIdempotencyStore`] delegates eviction to [`moka`]: entries are
//! dropped once the capacity bound is exceeded or `ttl` has elapsed since the
//! last write, whichever comes first. An evicted record behaves exactly like
//! one that was never written.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};

use crate::error::{Error, Result};
use crate::id::{IdempotencyKey, SessionId};

/// Default maximum number of tracked records.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Default record lifetime (2 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Identity of one record in the store.
///
/// When session binding is enabled the key is scoped to the session that
/// presented it, so two sessions never share a record.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    scope: Option<SessionId>,
    key: IdempotencyKey,
}

impl RecordKey {
    /// Creates a record key scoped to a session.
    #[must_use]
    pub fn scoped(session: SessionId, key: IdempotencyKey) -> Self {
        Self {
            scope: Some(session),
            key,
        }
    }

    /// Creates a record key shared by every session presenting `key`.
    #[must_use]
    pub fn unscoped(key: IdempotencyKey) -> Self {
        Self { scope: None, key }
    }

    /// Returns the idempotency key.
    #[must_use]
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Returns the owning session, if scoped.
    #[must_use]
    pub fn scope(&self) -> Option<&SessionId> {
        self.scope.as_ref()
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordKey")
            .field("scope", &self.scope.as_ref().map(SessionId::as_str))
            .field("key", &self.key)
            .finish()
    }
}

/// A record held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyRecord {
    /// The protected operation is running.
    Processing,
    /// The operation finished; the payload is replayed verbatim.
    Completed {
        /// Serialized success response.
        payload: Bytes,
    },
}

/// Observable status of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStatus {
    /// Never seen, released, or evicted.
    NotFound,
    /// Currently executing.
    Processing,
    /// Completed with the stored payload.
    Completed(Bytes),
}

impl KeyStatus {
    /// Returns a stable lowercase label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Processing => "processing",
            Self::Completed(_) => "completed",
        }
    }
}

impl From<Option<IdempotencyRecord>> for KeyStatus {
    fn from(value: Option<IdempotencyRecord>) -> Self {
        match value {
            None => Self::NotFound,
            Some(IdempotencyRecord::Processing) => Self::Processing,
            Some(IdempotencyRecord::Completed { payload }) => Self::Completed(payload),
        }
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Approximate number of live records.
    pub entries: u64,
    /// Status lookups that found a record.
    pub hits: u64,
    /// Status lookups that found nothing.
    pub misses: u64,
}

impl StoreStats {
    /// Fraction of lookups that found a record, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounds for a store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum number of records held at once.
    pub max_entries: u64,
    /// Lifetime of a record after its last write.
    pub ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_TTL,
        }
    }
}

impl StoreConfig {
    /// Validates the bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if capacity or TTL is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::InvalidInput(
                "idempotency store max_entries must be greater than 0".to_string(),
            ));
        }
        if self.ttl.is_zero() {
            return Err(Error::InvalidInput(
                "idempotency store ttl must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Concurrent key → record mapping with atomic transitions.
///
/// Implementations must make each method a single atomic step per key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the current status of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the backend cannot be reached.
    async fn status(&self, key: &RecordKey) -> Result<KeyStatus>;

    /// Inserts a `PROCESSING` record if no live record exists.
    ///
    /// Returns `true` iff this call created the record. Among concurrent
    /// callers with the same fresh key exactly one observes `true`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the backend cannot be reached.
    async fn begin_if_absent(&self, key: &RecordKey) -> Result<bool>;

    /// Transitions a `PROCESSING` record to `COMPLETED` with `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the record is absent or
    /// already completed.
    async fn complete(&self, key: &RecordKey, payload: Bytes) -> Result<()>;

    /// Removes a `PROCESSING` record so the same key can be retried.
    ///
    /// Releasing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the record is completed.
    async fn fail(&self, key: &RecordKey) -> Result<()>;

    /// Returns current statistics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the backend cannot be reached.
    async fn stats(&self) -> Result<StoreStats>;
}

/// In-memory store backed by a [`moka::future::Cache`].
///
/// # Thread Safety
///
/// `MemoryIdempotencyStore` is `Send + Sync`; clones share the same records.
#[derive(Clone)]
pub struct MemoryIdempotencyStore {
    records: Cache<RecordKey, IdempotencyRecord>,
    counters: std::sync::Arc<Counters>,
    config: StoreConfig,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl fmt::Debug for MemoryIdempotencyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryIdempotencyStore")
            .field("config", &self.config)
            .field("entries", &self.records.entry_count())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl MemoryIdempotencyStore {
    /// Creates a store with the given bounds.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let records = Cache::builder()
            .name("idempotency-records")
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();

        tracing::info!(
            ttl_secs = config.ttl.as_secs(),
            max_entries = config.max_entries,
            "Idempotency store initialized"
        );

        Self {
            records,
            counters: std::sync::Arc::default(),
            config,
        }
    }

    /// Returns the configured bounds.
    #[must_use]
    pub const fn config(&self) -> StoreConfig {
        self.config
    }

    /// Runs pending eviction and expiration work immediately.
    pub async fn run_pending_tasks(&self) {
        self.records.run_pending_tasks().await;
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn status(&self, key: &RecordKey) -> Result<KeyStatus> {
        let record = self.records.get(key).await;
        let counter = if record.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let status = KeyStatus::from(record);
        tracing::debug!(key = ?key, status = status.label(), "Idempotency key status");
        Ok(status)
    }

    async fn begin_if_absent(&self, key: &RecordKey) -> Result<bool> {
        let entry = self
            .records
            .entry(key.clone())
            .or_insert(IdempotencyRecord::Processing)
            .await;
        let won = entry.is_fresh();
        if won {
            tracing::debug!(key = ?key, "Marked idempotency key as PROCESSING");
        }
        Ok(won)
    }

    async fn complete(&self, key: &RecordKey, payload: Bytes) -> Result<()> {
        let result = self
            .records
            .entry(key.clone())
            .and_compute_with(|current| {
                let op = match current.map(moka::Entry::into_value) {
                    Some(IdempotencyRecord::Processing) => {
                        Op::Put(IdempotencyRecord::Completed { payload })
                    }
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::ReplacedWith(_) => {
                tracing::debug!(key = ?key, "Marked idempotency key as COMPLETED");
                Ok(())
            }
            CompResult::StillNone(_) => Err(transition_error(key, "record is absent")),
            _ => Err(transition_error(key, "record is not PROCESSING")),
        }
    }

    async fn fail(&self, key: &RecordKey) -> Result<()> {
        let result = self
            .records
            .entry(key.clone())
            .and_compute_with(|current| {
                let op = match current.map(moka::Entry::into_value) {
                    Some(IdempotencyRecord::Processing) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::Removed(_) => {
                tracing::debug!(key = ?key, "Released idempotency key (failed request)");
                Ok(())
            }
            CompResult::StillNone(_) => Ok(()),
            _ => Err(transition_error(key, "completed records cannot be released")),
        }
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            entries: self.records.entry_count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        })
    }
}

fn transition_error(key: &RecordKey, message: &str) -> Error {
    Error::InvalidTransition {
        key: key.key().fingerprint().to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> RecordKey {
        RecordKey::unscoped(raw.parse().unwrap())
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let store = MemoryIdempotencyStore::default();
        assert_eq!(store.status(&key("never")).await.unwrap(), KeyStatus::NotFound);
    }

    #[tokio::test]
    async fn test_begin_only_once() {
        let store = MemoryIdempotencyStore::default();
        assert!(store.begin_if_absent(&key("k1")).await.unwrap());
        assert!(!store.begin_if_absent(&key("k1")).await.unwrap());
        assert_eq!(store.status(&key("k1")).await.unwrap(), KeyStatus::Processing);
    }

    #[tokio::test]
    async fn test_complete_stores_payload() {
        let store = MemoryIdempotencyStore::default();
        let k = key("k2");
        store.begin_if_absent(&k).await.unwrap();
        store.complete(&k, Bytes::from_static(b"{\"fileId\":\"a\"}")).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                store.status(&k).await.unwrap(),
                KeyStatus::Completed(Bytes::from_static(b"{\"fileId\":\"a\"}"))
            );
        }
    }

    #[tokio::test]
    async fn test_completed_record_is_immutable() {
        let store = MemoryIdempotencyStore::default();
        let k = key("k3");
        store.begin_if_absent(&k).await.unwrap();
        store.complete(&k, Bytes::from_static(b"first")).await.unwrap();

        let err = store.complete(&k, Bytes::from_static(b"second")).await;
        assert!(matches!(err, Err(Error::InvalidTransition { .. })));
        assert!(matches!(store.fail(&k).await, Err(Error::InvalidTransition { .. })));
        assert!(!store.begin_if_absent(&k).await.unwrap());
        assert_eq!(
            store.status(&k).await.unwrap(),
            KeyStatus::Completed(Bytes::from_static(b"first"))
        );
    }

    #[tokio::test]
    async fn test_complete_without_begin_is_rejected() {
        let store = MemoryIdempotencyStore::default();
        let err = store.complete(&key("k4"), Bytes::from_static(b"x")).await;
        assert!(matches!(err, Err(Error::InvalidTransition { .. })));
        assert_eq!(store.status(&key("k4")).await.unwrap(), KeyStatus::NotFound);
    }

    #[tokio::test]
    async fn test_fail_releases_key() {
        let store = MemoryIdempotencyStore::default();
        let k = key("k5");
        store.begin_if_absent(&k).await.unwrap();
        store.fail(&k).await.unwrap();
        assert_eq!(store.status(&k).await.unwrap(), KeyStatus::NotFound);
        assert!(store.begin_if_absent(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_on_absent_key_is_noop() {
        let store = MemoryIdempotencyStore::default();
        store.fail(&key("k6")).await.unwrap();
    }

    #[tokio::test]
    async fn test_scoped_keys_are_isolated() {
        let store = MemoryIdempotencyStore::default();
        let raw: IdempotencyKey = "shared".parse().unwrap();
        let a = RecordKey::scoped("session-a".parse().unwrap(), raw.clone());
        let b = RecordKey::scoped("session-b".parse().unwrap(), raw.clone());

        assert!(store.begin_if_absent(&a).await.unwrap());
        assert!(store.begin_if_absent(&b).await.unwrap());
        assert_eq!(store.status(&RecordKey::unscoped(raw)).await.unwrap(), KeyStatus::NotFound);
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let store = MemoryIdempotencyStore::default();
        let k = key("k7");
        store.status(&k).await.unwrap();
        store.begin_if_absent(&k).await.unwrap();
        store.status(&k).await.unwrap();
        store.run_pending_tasks().await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_stats_hit_rate_is_zero() {
        let stats = StoreStats {
            entries: 0,
            hits: 0,
            misses: 0,
        };
        assert!(stats.hit_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_validation() {
        assert!(StoreConfig::default().validate().is_ok());
        let zero_capacity = StoreConfig {
            max_entries: 0,
            ..StoreConfig::default()
        };
        assert!(zero_capacity.validate().is_err());
        let zero_ttl = StoreConfig {
            ttl: Duration::ZERO,
            ..StoreConfig::default()
        };
        assert!(zero_ttl.validate().is_err());
    }
}
