//! HTTP route handlers.

pub mod keys;
pub mod stats;
pub mod upload;

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

/// `/api` routes.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(upload::routes())
        .merge(keys::routes())
        .merge(stats::routes())
}
