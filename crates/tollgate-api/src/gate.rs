//! Idempotency gate middleware.
//!
//! Runs in front of protected handlers and enforces at-most-once execution
//! per idempotency key:
//!
//! | Key status   | Action                                          |
//! |--------------|-------------------------------------------------|
//! | no key       | pass through (`optional`) or 400 (`required`)   |
//! | `NOT_FOUND`  | validate, then `begin_if_absent`; win → forward |
//! | `PROCESSING` | 409 with `Retry-After`, handler never invoked   |
//! | `COMPLETED`  | replay the stored body verbatim                 |
//!
//! A forwarded request carries an [`IdempotencyClaim`] in its extensions.
//! The handler adapter takes ownership of the claim; if the handler never
//! does (an extractor rejected the request, or the request was dropped), the
//! gate releases the key so the client can retry.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, HeaderName};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::Instrument;

use tollgate_core::observability::idempotency_span;
use tollgate_core::{IdempotencyKey, IdempotencyStore, KeyIssuer, KeyStatus, RecordKey};

use crate::config::{IdempotencyConfig, KeyPolicy};
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::metrics::record_gate_decision;

/// Header set on replayed responses.
pub const REPLAY_HEADER: &str = "x-idempotent-replay";

/// Decision taken by the gate for one request.
#[derive(Debug)]
pub enum GateDecision {
    /// Not subject to idempotency control; forward untouched.
    PassThrough,
    /// This request won the key; forward with the claim attached.
    Admit(IdempotencyClaim),
    /// The key already completed; answer with the stored body.
    Replay(Bytes),
}

impl GateDecision {
    const fn outcome(&self) -> &'static str {
        match self {
            Self::PassThrough => "pass_through",
            Self::Admit(_) => "admitted",
            Self::Replay(_) => "replayed",
        }
    }
}

/// Exclusive right to execute the operation for one key.
///
/// Exactly one claim exists per `PROCESSING` record. It is resolved by
/// [`complete`](Self::complete) or [`release`](Self::release).
#[derive(Clone)]
pub struct IdempotencyClaim {
    record_key: RecordKey,
    store: Arc<dyn IdempotencyStore>,
    handed_off: Arc<AtomicBool>,
}

impl fmt::Debug for IdempotencyClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyClaim")
            .field("record_key", &self.record_key)
            .field("handed_off", &self.is_handed_off())
            .finish_non_exhaustive()
    }
}

impl IdempotencyClaim {
    /// Creates a claim for a key the caller has already begun.
    #[must_use]
    pub fn new(record_key: RecordKey, store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            record_key,
            store,
            handed_off: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the claimed idempotency key.
    #[must_use]
    pub fn key(&self) -> &IdempotencyKey {
        self.record_key.key()
    }

    /// Returns the store key the claim holds.
    #[must_use]
    pub fn record_key(&self) -> &RecordKey {
        &self.record_key
    }

    /// Marks the claim as owned by the handler adapter.
    pub fn hand_off(&self) {
        self.handed_off.store(true, Ordering::SeqCst);
    }

    /// Returns true once the handler adapter has taken ownership.
    #[must_use]
    pub fn is_handed_off(&self) -> bool {
        self.handed_off.load(Ordering::SeqCst)
    }

    /// Records the successful result.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is no longer `PROCESSING`.
    pub async fn complete(&self, payload: Bytes) -> tollgate_core::Result<()> {
        self.store.complete(&self.record_key, payload).await
    }

    /// Releases the key so the same request can be retried.
    ///
    /// Release failures are logged; the record then ages out by TTL.
    pub async fn release(&self) {
        if let Err(error) = self.store.fail(&self.record_key).await {
            tracing::error!(
                key = self.key().fingerprint(),
                error = %error,
                "Failed to release idempotency key"
            );
        }
    }
}

/// Releases an unclaimed key when the request ends without a hand-off.
struct ReleaseGuard {
    claim: Option<IdempotencyClaim>,
}

impl ReleaseGuard {
    const fn new(claim: IdempotencyClaim) -> Self {
        Self { claim: Some(claim) }
    }

    async fn finish(mut self) {
        if let Some(claim) = self.claim.take() {
            if !claim.is_handed_off() {
                tracing::debug!(
                    key = claim.key().fingerprint(),
                    "Handler did not run; releasing idempotency key"
                );
                claim.release().await;
            }
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        if claim.is_handed_off() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                claim.release().await;
            });
        }
    }
}

/// Idempotency gate: decides pass-through, conflict, or replay.
pub struct IdempotencyGate {
    store: Arc<dyn IdempotencyStore>,
    issuer: KeyIssuer,
    config: IdempotencyConfig,
}

impl fmt::Debug for IdempotencyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyGate")
            .field("issuer", &self.issuer)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGate {
    /// Creates a gate over an explicitly constructed store and issuer.
    #[must_use]
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        issuer: KeyIssuer,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            store,
            issuer,
            config,
        }
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Returns the key issuer.
    #[must_use]
    pub fn issuer(&self) -> &KeyIssuer {
        &self.issuer
    }

    /// Returns the gate configuration.
    #[must_use]
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Returns true if `path` falls under a protected prefix.
    #[must_use]
    pub fn is_protected(&self, path: &str) -> bool {
        self.config
            .protected_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Decides what to do with a request to `path`.
    ///
    /// # Errors
    ///
    /// Returns the response to send instead of running the handler: 400 for
    /// an unusable key, 409 while the key is processing, 503 when the store
    /// cannot be consulted.
    pub async fn decide(
        &self,
        path: &str,
        ctx: &RequestContext,
    ) -> Result<GateDecision, ApiError> {
        if !self.is_protected(path) {
            return Ok(GateDecision::PassThrough);
        }

        let raw = ctx
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty());
        let Some(raw) = raw else {
            return match self.config.key_policy {
                KeyPolicy::Optional => {
                    tracing::debug!(path, "Protected request without key; forwarding");
                    Ok(GateDecision::PassThrough)
                }
                KeyPolicy::Required => {
                    record_gate_decision("rejected");
                    Err(ApiError::invalid_idempotency_key()
                        .with_request_id(ctx.request_id.clone()))
                }
            };
        };

        let key: IdempotencyKey = raw.parse().map_err(|_| {
            record_gate_decision("rejected");
            ApiError::invalid_idempotency_key().with_request_id(ctx.request_id.clone())
        })?;

        let record_key = if self.config.bind_to_session {
            RecordKey::scoped(ctx.session_id.clone(), key)
        } else {
            RecordKey::unscoped(key)
        };

        let status = self
            .store
            .status(&record_key)
            .await
            .map_err(|error| store_unavailable(error, ctx))?;

        match status {
            KeyStatus::Processing => Err(self.conflict(ctx)),
            KeyStatus::Completed(payload) => Ok(GateDecision::Replay(payload)),
            KeyStatus::NotFound => {
                if self.config.bind_to_session && !self.issuer.validate(raw, &ctx.session_id) {
                    return self.reject_unbound(&record_key, ctx).await;
                }

                let won = self
                    .store
                    .begin_if_absent(&record_key)
                    .await
                    .map_err(|error| store_unavailable(error, ctx))?;
                if won {
                    Ok(GateDecision::Admit(IdempotencyClaim::new(
                        record_key,
                        Arc::clone(&self.store),
                    )))
                } else {
                    Err(self.conflict(ctx))
                }
            }
        }
    }

    /// Answers a key that no longer validates against the session.
    ///
    /// The session key is refreshed when a protected request completes, so a
    /// duplicate that looked the record up before that point now holds a
    /// stale key. The record is read again: only a key with no record at all
    /// is rejected.
    async fn reject_unbound(
        &self,
        record_key: &RecordKey,
        ctx: &RequestContext,
    ) -> Result<GateDecision, ApiError> {
        let status = self
            .store
            .status(record_key)
            .await
            .map_err(|error| store_unavailable(error, ctx))?;

        match status {
            KeyStatus::Completed(payload) => Ok(GateDecision::Replay(payload)),
            KeyStatus::Processing => Err(self.conflict(ctx)),
            KeyStatus::NotFound => {
                tracing::debug!("Idempotency key not bound to session");
                record_gate_decision("rejected");
                Err(ApiError::invalid_idempotency_key().with_request_id(ctx.request_id.clone()))
            }
        }
    }

    fn conflict(&self, ctx: &RequestContext) -> ApiError {
        tracing::info!("Duplicate request while processing; rejecting");
        record_gate_decision("conflict");
        ApiError::conflict_in_progress(self.config.retry_after_secs)
            .with_request_id(ctx.request_id.clone())
    }
}

fn store_unavailable(error: tollgate_core::Error, ctx: &RequestContext) -> ApiError {
    tracing::error!(error = %error, "Idempotency store unavailable; failing closed");
    record_gate_decision("store_unavailable");
    ApiError::from(error).with_request_id(ctx.request_id.clone())
}

/// Gate middleware.
///
/// Must run inside [`context_middleware`](crate::context::context_middleware).
pub async fn idempotency_gate_middleware(
    State(gate): State<Arc<IdempotencyGate>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::from_headers(req.headers()));

    let path = req.uri().path().to_string();
    let decision = match gate.decide(&path, &ctx).await {
        Ok(decision) => decision,
        Err(err) => return err.into_response(),
    };

    if gate.is_protected(&path) {
        record_gate_decision(decision.outcome());
    }

    match decision {
        GateDecision::PassThrough => next.run(req).await,
        GateDecision::Replay(payload) => {
            tracing::debug!(path = %path, "Replaying completed response");
            replay_response(payload)
        }
        GateDecision::Admit(claim) => {
            let span = idempotency_span("gate", claim.key(), &ctx.request_id);
            async move {
                tracing::debug!(path = %path, "Admitted idempotent request");
                let mut req = req;
                req.extensions_mut().insert(claim.clone());

                let guard = ReleaseGuard::new(claim);
                let response = next.run(req).await;
                guard.finish().await;
                response
            }
            .instrument(span)
            .await
        }
    }
}

/// Builds the replay response: 200 with the stored bytes, unmodified.
#[must_use]
pub fn replay_response(payload: Bytes) -> Response {
    let mut response = (StatusCode::OK, Body::from(payload)).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(REPLAY_HEADER),
        HeaderValue::from_static("true"),
    );
    response
}
