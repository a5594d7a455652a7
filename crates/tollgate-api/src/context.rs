//! Request context extraction and session middleware.
//!
//! Every request is attributed to a session. Browsers carry it in the
//! `tollgate_session` cookie; other clients may send `X-Session-Id`. A request
//! with neither (or with an unparseable value) starts a new session, and the
//! response sets the cookie so the next call lands in the same session.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::header::{COOKIE, HeaderName, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use ulid::Ulid;

use tollgate_core::SessionId;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Header carrying an explicit session id (non-browser clients).
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Cookie carrying the session id.
pub const SESSION_COOKIE: &str = "tollgate_session";

/// Per-request context derived from headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Session the request belongs to.
    pub session_id: SessionId,
    /// Request ID for tracing/correlation.
    pub request_id: String,
    /// Raw `X-Idempotency-Key` value, if present.
    pub idempotency_key: Option<String>,
    /// True when the session was started by this request.
    pub new_session: bool,
}

impl RequestContext {
    /// Builds a context from request headers, starting a session if needed.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let request_id =
            request_id_from_headers(headers).unwrap_or_else(|| Ulid::new().to_string());
        let idempotency_key = header_string(headers, IDEMPOTENCY_KEY_HEADER);

        let (session_id, new_session) = session_from_headers(headers)
            .map_or_else(|| (SessionId::generate(), true), |session| (session, false));

        Self {
            session_id,
            request_id,
            idempotency_key,
            new_session,
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let ctx = Self::from_headers(&parts.headers);
        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

/// Context middleware.
///
/// Runs outermost so the gate and handlers all see the same
/// [`RequestContext`]. Echoes the request id and, for new sessions, sets the
/// session cookie on the response.
pub async fn context_middleware(req: Request<Body>, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();

    let ctx = match RequestContext::from_request_parts(&mut parts, &()).await {
        Ok(ctx) => ctx,
        Err(err) => match err {},
    };

    let req = Request::from_parts(parts, body);
    let request_id = ctx.request_id.clone();

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    if ctx.new_session {
        if let Ok(value) = HeaderValue::from_str(&session_cookie(&ctx.session_id)) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

/// Renders the `Set-Cookie` value for a session.
#[must_use]
pub fn session_cookie(session: &SessionId) -> String {
    format!("{SESSION_COOKIE}={session}; Path=/; HttpOnly; SameSite=Lax")
}

fn session_from_headers(headers: &HeaderMap) -> Option<SessionId> {
    cookie_value(headers, SESSION_COOKIE)
        .or_else(|| header_string(headers, SESSION_ID_HEADER))
        .and_then(|raw| raw.parse().ok())
}

/// Finds `name` in the request's `Cookie` headers (RFC 6265 `cookie-string`).
///
/// The value is everything after the first `=`, with an optional pair of
/// surrounding double quotes removed.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| unquote(value.trim()).to_string())
        .filter(|value| !value.is_empty())
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_string(headers, REQUEST_ID_HEADER)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?;
    header_value_to_string(value)
}

fn header_value_to_string(value: &HeaderValue) -> Option<String> {
    value.to_str().ok().map(str::to_string)
}
