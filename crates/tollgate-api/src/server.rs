//! API server implementation.
//!
//! Provides health, ready, metrics, and the idempotency-protected upload API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tollgate_core::{IdempotencyStore, KeyIssuer, MemoryIdempotencyStore, Result};

use crate::config::{Config, CorsConfig};
use crate::context::{IDEMPOTENCY_KEY_HEADER, REQUEST_ID_HEADER, SESSION_ID_HEADER};
use crate::gate::{IdempotencyGate, REPLAY_HEADER};
use crate::upload::{DiscardingUploadOperation, UploadOperation};

// ============================================================================
// Health and Ready Responses
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Idempotency gate (owns the store and key issuer).
    pub gate: Arc<IdempotencyGate>,
    /// The protected upload operation.
    pub uploads: Arc<dyn UploadOperation>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .field("uploads", &"<UploadOperation>")
            .finish()
    }
}

impl AppState {
    /// Creates application state from explicitly constructed collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn IdempotencyStore>,
        issuer: KeyIssuer,
        uploads: Arc<dyn UploadOperation>,
    ) -> Self {
        let gate = Arc::new(IdempotencyGate::new(
            store,
            issuer,
            config.idempotency.clone(),
        ));
        Self {
            config,
            gate,
            uploads,
        }
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// Returns 200 OK if the service is alive.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Probes the idempotency store; protected requests fail closed while it is
/// unreachable, so the service is not ready either.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.gate.store().stats().await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("idempotency store check failed: {e}")),
            }),
        ),
    }
}

// ============================================================================
// Server
// ============================================================================

/// The Tollgate API server.
pub struct Server {
    config: Config,
    store: Arc<dyn IdempotencyStore>,
    issuer: KeyIssuer,
    uploads: Arc<dyn UploadOperation>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("store", &"<IdempotencyStore>")
            .field("issuer", &self.issuer)
            .field("uploads", &"<UploadOperation>")
            .finish()
    }
}

impl Server {
    /// Creates a new server with an in-memory store sized from `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        ServerBuilder::new().config(config).build()
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self) -> Router {
        let state = Arc::new(AppState::new(
            self.config.clone(),
            Arc::clone(&self.store),
            self.issuer.clone(),
            Arc::clone(&self.uploads),
        ));

        let cors = self.build_cors_layer();

        let gate_layer = middleware::from_fn_with_state(
            Arc::clone(&state.gate),
            crate::gate::idempotency_gate_middleware,
        );
        let context_layer = middleware::from_fn(crate::context::context_middleware);
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        Router::new()
            // Health, ready, and metrics endpoints (no idempotency control)
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .merge(crate::routes::api_routes().route_layer(gate_layer))
            .layer(DefaultBodyLimit::max(self.config.max_upload_bytes))
            // Middleware (order matters): metrics outermost for timing, then
            // trace, then CORS, then session context.
            .layer(context_layer)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
            .with_state(state)
    }

    /// Builds the CORS layer from configuration.
    fn build_cors_layer(&self) -> CorsLayer {
        let cors_config = &self.config.cors;
        let cors = Self::build_cors_base(cors_config);
        Self::apply_cors_allowed_origins(cors, cors_config)
    }

    fn build_cors_base(cors_config: &CorsConfig) -> CorsLayer {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
                header::HeaderName::from_static(SESSION_ID_HEADER),
                header::HeaderName::from_static(REQUEST_ID_HEADER),
            ])
            // Expose headers the browser needs to read
            .expose_headers([
                header::CONTENT_TYPE,
                header::CONTENT_LENGTH,
                header::RETRY_AFTER,
                header::HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
                header::HeaderName::from_static(REQUEST_ID_HEADER),
                header::HeaderName::from_static(REPLAY_HEADER),
            ])
            .max_age(Duration::from_secs(cors_config.max_age_seconds))
    }

    fn cors_allows_any_origin(cors_config: &CorsConfig) -> bool {
        cors_config.allowed_origins.len() == 1
            && cors_config
                .allowed_origins
                .first()
                .is_some_and(|origin| origin == "*")
    }

    fn parse_cors_origins(cors_config: &CorsConfig) -> Vec<HeaderValue> {
        let mut allowed = Vec::new();
        for origin in &cors_config.allowed_origins {
            match HeaderValue::from_str(origin) {
                Ok(value) => allowed.push(value),
                Err(_) => {
                    tracing::error!(
                        origin = %origin,
                        "Invalid CORS origin; expected a valid HeaderValue"
                    );
                }
            }
        }
        allowed
    }

    fn apply_cors_allowed_origins(cors: CorsLayer, cors_config: &CorsConfig) -> CorsLayer {
        if cors_config.allowed_origins.is_empty() {
            return cors;
        }

        if Self::cors_allows_any_origin(cors_config) {
            return cors.allow_origin(Any);
        }

        if cors_config
            .allowed_origins
            .iter()
            .any(|origin| origin == "*")
        {
            tracing::error!(
                origins = ?cors_config.allowed_origins,
                "Invalid CORS config: '*' must be the only allowed origin"
            );
            return cors;
        }

        let allowed = Self::parse_cors_origins(cors_config);

        if allowed.is_empty() {
            tracing::warn!("All configured CORS origins were invalid; disabling CORS");
            cors
        } else {
            tracing::info!(origins = ?cors_config.allowed_origins, "CORS configured");
            cors.allow_origin(AllowOrigin::list(allowed))
        }
    }

    /// Starts the server and blocks until ctrl-c or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the server cannot
    /// bind to the port.
    pub async fn serve(&self) -> Result<()> {
        self.validate_config()?;

        crate::metrics::init_metrics();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.create_router();

        tracing::info!(
            http_port = self.config.http_port,
            protected = ?self.config.idempotency.protected_prefixes,
            key_policy = ?self.config.idempotency.key_policy,
            ttl_secs = self.config.idempotency.ttl_secs,
            "Starting Tollgate API server"
        );

        let listener =
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| tollgate_core::Error::Internal {
                    message: format!("failed to bind to {addr}: {e}"),
                })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| tollgate_core::Error::Internal {
                message: format!("server error: {e}"),
            })?;

        tracing::info!("Server stopped");
        Ok(())
    }

    /// Creates a test router for the server.
    ///
    /// Routers created from the same server share its store and issuer.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }

    fn validate_config(&self) -> Result<()> {
        // Enforce "no wildcard in production" for CORS.
        if !self.config.debug
            && self
                .config
                .cors
                .allowed_origins
                .iter()
                .any(|origin| origin == "*")
        {
            return Err(tollgate_core::Error::InvalidInput(
                "cors.allowed_origins cannot include '*' when debug=false".to_string(),
            ));
        }

        self.config.validate()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    store: Option<Arc<dyn IdempotencyStore>>,
    uploads: Arc<dyn UploadOperation>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "<IdempotencyStore>"))
            .field("uploads", &"<UploadOperation>")
            .finish()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            store: None,
            uploads: Arc::new(DiscardingUploadOperation),
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode.
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the idempotency state store.
    ///
    /// By default, an in-memory store sized from the configuration is used.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the protected upload operation.
    #[must_use]
    pub fn upload_operation(mut self, uploads: Arc<dyn UploadOperation>) -> Self {
        self.uploads = uploads;
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        let store = self.store.unwrap_or_else(|| {
            Arc::new(MemoryIdempotencyStore::new(
                self.config.idempotency.store_config(),
            ))
        });
        let issuer = KeyIssuer::new(
            self.config.session.max_sessions,
            self.config.session.idle_timeout(),
        );
        Server {
            config: self.config,
            store,
            issuer,
            uploads: self.uploads,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;
    use tollgate_core::store::{KeyStatus, RecordKey, StoreStats};
    use tower::ServiceExt;

    struct UnreachableStore;

    #[async_trait]
    impl IdempotencyStore for UnreachableStore {
        async fn status(&self, _key: &RecordKey) -> tollgate_core::Result<KeyStatus> {
            Err(tollgate_core::Error::store_unavailable("unreachable"))
        }
        async fn begin_if_absent(&self, _key: &RecordKey) -> tollgate_core::Result<bool> {
            Err(tollgate_core::Error::store_unavailable("unreachable"))
        }
        async fn complete(&self, _key: &RecordKey, _payload: Bytes) -> tollgate_core::Result<()> {
            Err(tollgate_core::Error::store_unavailable("unreachable"))
        }
        async fn fail(&self, _key: &RecordKey) -> tollgate_core::Result<()> {
            Err(tollgate_core::Error::store_unavailable("unreachable"))
        }
        async fn stats(&self) -> tollgate_core::Result<StoreStats> {
            Err(tollgate_core::Error::store_unavailable("unreachable"))
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() -> Result<()> {
        let server = ServerBuilder::new().build();
        let router = server.test_router();

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .context("build request")?;

        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .context("read response body")?;
        let health: HealthResponse = serde_json::from_slice(&body).context("parse JSON body")?;
        assert_eq!(health.status, "ok");
        Ok(())
    }

    #[tokio::test]
    async fn test_ready_endpoint() -> Result<()> {
        let server = ServerBuilder::new().build();
        let router = server.test_router();

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .context("build request")?;

        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .context("read response body")?;
        let ready: ReadyResponse = serde_json::from_slice(&body).context("parse JSON body")?;
        assert!(ready.ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_ready_fails_when_store_unreachable() -> Result<()> {
        let server = ServerBuilder::new()
            .store(Arc::new(UnreachableStore))
            .build();
        let router = server.test_router();

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .context("build request")?;

        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .context("read response body")?;
        let ready: ReadyResponse = serde_json::from_slice(&body).context("parse JSON body")?;
        assert!(!ready.ready);
        assert!(ready.message.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_idempotency_header() -> Result<()> {
        let mut config = Config::default();
        config.cors.allowed_origins = vec!["https://app.example".to_string()];
        let router = Server::new(config).test_router();

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/p2p/upload")
            .header(header::ORIGIN, "https://app.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-idempotency-key")
            .body(Body::empty())
            .context("build request")?;

        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

        let allowed = response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .and_then(|value| value.to_str().ok())
            .context("missing allow-headers")?;
        assert!(allowed.contains("x-idempotency-key"));
        Ok(())
    }

    #[test]
    fn test_wildcard_cors_rejected_outside_debug() {
        let mut config = Config::default();
        config.cors.allowed_origins = vec!["*".to_string()];

        let server = Server::new(config.clone());
        assert!(server.validate_config().is_err());

        config.debug = true;
        assert!(Server::new(config).validate_config().is_ok());
    }

    #[test]
    fn test_builder_sets_port_and_debug() {
        let server = ServerBuilder::new().http_port(9000).debug(true).build();
        assert_eq!(server.config().http_port, 9000);
        assert!(server.config().debug);
    }
}
