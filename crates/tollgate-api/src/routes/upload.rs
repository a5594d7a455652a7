//! Peer-to-peer upload route.
//!
//! ## Routes
//!
//! - `POST /api/p2p/upload` - Upload one file (multipart field `file`)
//!
//! The route sits behind the idempotency gate. A successful upload stores the
//! receipt for replay, refreshes the session's key, and returns the receipt
//! with `newIdempotencyKey` added. Replays carry the stored receipt only.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::adapter;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::gate::IdempotencyClaim;
use crate::server::AppState;
use crate::upload::{FileUpload, UploadReceipt};

/// Multipart field carrying the file.
pub const FILE_FIELD: &str = "file";

/// Response to a first (non-replayed) upload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// Stored receipt fields.
    #[serde(flatten)]
    pub receipt: UploadReceipt,
    /// Key to present on the next upload.
    pub new_idempotency_key: String,
}

/// Creates upload routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/p2p/upload", post(upload_file))
}

/// Upload a file.
///
/// POST /api/p2p/upload
pub(crate) async fn upload_file(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    claim: Option<Extension<IdempotencyClaim>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let file = read_file(multipart)
        .await
        .map_err(|e| e.with_request_id(ctx.request_id.clone()))?;

    tracing::info!(
        file_name = file.file_name.as_deref().unwrap_or("-"),
        size = file.size(),
        protected = claim.is_some(),
        "Uploading file"
    );

    let uploads = Arc::clone(&state.uploads);
    let claim = claim.map(|Extension(claim)| claim);
    let executed = adapter::execute(claim, async move { uploads.upload(file).await })
        .await
        .map_err(|e| e.with_request_id(ctx.request_id.clone()))?;

    let new_key = state.gate.issuer().refresh(&ctx.session_id);

    Ok(Json(UploadResponse {
        receipt: executed.value,
        new_idempotency_key: new_key.to_string(),
    }))
}

async fn read_file(mut multipart: Multipart) -> Result<FileUpload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {}", e.body_text())))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| {
            ApiError::bad_request(format!("failed to read file: {}", e.body_text()))
        })?;
        return Ok(FileUpload {
            file_name,
            content_type,
            bytes,
        });
    }
    Err(ApiError::bad_request(format!(
        "missing multipart field '{FILE_FIELD}'"
    )))
}
