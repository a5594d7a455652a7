//! API error types and HTTP response mapping.
//!
//! Every error leaves the server as
//! `{"error": <message>, "status": "error", "code": <CODE>}` so clients can
//! branch on `status` without parsing messages.

use axum::Json;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header::HeaderName;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use tollgate_core::Error as CoreError;

/// Message returned when a protected request carries an unusable key.
pub const INVALID_KEY_MESSAGE: &str = "Invalid or missing idempotency key";

/// Message returned while a key is `PROCESSING`.
pub const IN_PROGRESS_MESSAGE: &str = "Request is being processed, please wait";

/// Value of the `status` field on every error body.
pub const STATUS_ERROR: &str = "error";

/// Standard JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    /// Human-readable message (safe for clients).
    pub error: String,
    /// Always `"error"`.
    pub status: String,
    /// Stable machine-readable error code.
    pub code: String,
    /// Optional request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// HTTP API error with stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    request_id: Option<String>,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    /// Returns an error response for invalid input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Returns the 400 response for a missing, blank or unbound idempotency key.
    #[must_use]
    pub fn invalid_idempotency_key() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "INVALID_IDEMPOTENCY_KEY",
            INVALID_KEY_MESSAGE,
        )
    }

    /// Returns a 409 Conflict for in-progress idempotent requests with Retry-After header.
    #[must_use]
    pub fn conflict_in_progress(retry_after_secs: u64) -> Self {
        Self::new(StatusCode::CONFLICT, "REQUEST_IN_PROGRESS", IN_PROGRESS_MESSAGE)
            .with_retry_after(retry_after_secs)
    }

    /// Returns the 500 response for a failed protected operation.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "OPERATION_FAILED",
            message,
        )
    }

    /// Returns a 503 response (retryable).
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            message,
        )
    }

    /// Returns an internal error response.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    /// Attaches a request ID for correlation.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attaches a Retry-After header value in seconds.
    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            request_id: None,
            retry_after_secs: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = self.request_id;
        let retry_after_secs = self.retry_after_secs;
        let mut response = (
            self.status,
            Json(ApiErrorBody {
                error: self.message,
                status: STATUS_ERROR.to_string(),
                code: self.code.to_string(),
                request_id: request_id.clone(),
            }),
        )
            .into_response();

        if let Some(request_id) = request_id {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-request-id"), value);
            }
        }

        if let Some(secs) = retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("retry-after"), value);
            }
        }

        response
    }
}

/// Retry-After sent with errors a client may retry as-is.
const RETRYABLE_AFTER_SECS: u64 = 1;

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        let retryable = value.is_retryable();
        let error = match value {
            CoreError::InvalidKey { .. } => Self::invalid_idempotency_key(),
            CoreError::InvalidInput(message) => Self::bad_request(message),
            CoreError::StoreUnavailable { .. } => {
                Self::service_unavailable("Idempotency store unavailable")
            }
            CoreError::InvalidTransition { message, .. } | CoreError::Internal { message } => {
                Self::internal(message)
            }
        };
        if retryable {
            error.with_retry_after(RETRYABLE_AFTER_SECS)
        } else {
            error
        }
    }
}
