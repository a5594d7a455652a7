//! Store statistics.
//!
//! ## Routes
//!
//! - `GET /api/idempotency/stats` - Entry count and lookup hit rate

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::metrics::record_store_entries;
use crate::server::AppState;

/// Store statistics response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// Approximate number of live records.
    pub entries: u64,
    /// Status lookups that found a record.
    pub hits: u64,
    /// Status lookups that found nothing.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub hit_rate: f64,
}

/// Creates statistics routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/idempotency/stats", get(get_stats))
}

/// Get store statistics.
///
/// GET /api/idempotency/stats
pub(crate) async fn get_stats(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state
        .gate
        .store()
        .stats()
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    record_store_entries(stats.entries);

    Ok(Json(StatsResponse {
        entries: stats.entries,
        hits: stats.hits,
        misses: stats.misses,
        hit_rate: stats.hit_rate(),
    }))
}
