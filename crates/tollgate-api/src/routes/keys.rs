//! Idempotency key issuance.
//!
//! ## Routes
//!
//! - `GET /api/p2p/idempotency-key` - Issue a fresh key for the session

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::server::AppState;

/// Key issuance response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyKeyResponse {
    /// The session's new current key.
    pub idempotency_key: String,
}

/// Creates key issuance routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/p2p/idempotency-key", get(issue_key))
}

/// Issue a key.
///
/// GET /api/p2p/idempotency-key
///
/// Equivalent to rendering the upload page: any previously issued key for the
/// session stops validating.
pub(crate) async fn issue_key(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
) -> Json<IdempotencyKeyResponse> {
    let key = state.gate.issuer().refresh(&ctx.session_id);
    tracing::debug!(key = key.fingerprint(), "Issued idempotency key");
    Json(IdempotencyKeyResponse {
        idempotency_key: key.to_string(),
    })
}
