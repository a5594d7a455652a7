//! The protected upload operation.
//!
//! Persisting uploaded content is outside this service; the gate only needs
//! something to invoke that either returns a receipt or fails.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// Value of `status` in a successful receipt.
pub const STATUS_SUCCESS: &str = "success";

/// A file received from a multipart upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    /// Client-supplied file name, if any.
    pub file_name: Option<String>,
    /// Client-supplied content type, if any.
    pub content_type: Option<String>,
    /// File contents.
    pub bytes: Bytes,
}

impl FileUpload {
    /// Size of the upload in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Descriptor returned for an accepted upload.
///
/// This is the body stored for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    /// Server-assigned file id.
    pub file_id: String,
    /// Original file name.
    pub file_name: Option<String>,
    /// Size in bytes.
    pub file_size: u64,
    /// Content type as sent by the client.
    pub content_type: Option<String>,
    /// Always `"success"`.
    pub status: String,
}

impl UploadReceipt {
    /// Builds a success receipt for `upload` stored under `file_id`.
    #[must_use]
    pub fn accepted(file_id: impl Into<String>, upload: &FileUpload) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: upload.file_name.clone(),
            file_size: upload.size(),
            content_type: upload.content_type.clone(),
            status: STATUS_SUCCESS.to_string(),
        }
    }
}

/// Upload failure reported by an [`UploadOperation`].
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The content was rejected.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The backing storage failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<UploadError> for ApiError {
    fn from(value: UploadError) -> Self {
        Self::operation_failed(format!("Upload failed: {value}"))
    }
}

/// The side-effecting operation protected by the gate.
#[async_trait]
pub trait UploadOperation: Send + Sync {
    /// Stores `upload` and returns its receipt.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload could not be stored; the idempotency
    /// key is then released for retry.
    async fn upload(&self, upload: FileUpload) -> Result<UploadReceipt, UploadError>;
}

/// Accepts every upload and assigns a fresh file id without keeping content.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingUploadOperation;

#[async_trait]
impl UploadOperation for DiscardingUploadOperation {
    async fn upload(&self, upload: FileUpload) -> Result<UploadReceipt, UploadError> {
        let file_id = Uuid::new_v4().to_string();
        tracing::info!(
            file_id = %file_id,
            size = upload.size(),
            "Accepted upload"
        );
        Ok(UploadReceipt::accepted(file_id, &upload))
    }
}
