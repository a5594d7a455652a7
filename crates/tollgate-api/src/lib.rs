//! # tollgate-api
//!
//! HTTP composition layer for idempotent file uploads.
//!
//! This crate wires the primitives from `tollgate-core` into an axum server:
//!
//! - **Session context**: session cookie / header and request ids
//! - **Idempotency gate**: middleware enforcing at-most-once execution
//! - **Handler adapter**: runs the protected operation and records its outcome
//! - **Observability**: metrics, tracing, and health checks
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health                    - Health check
//! GET  /ready                     - Readiness check (probes the store)
//! GET  /metrics                   - Prometheus metrics
//! POST /api/p2p/upload            - Upload (protected by X-Idempotency-Key)
//! GET  /api/p2p/idempotency-key   - Issue a fresh key for the session
//! GET  /api/idempotency/stats     - Store statistics
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tollgate_api::server::Server;
//!
//! let server = Server::builder().http_port(8080).build();
//!
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod upload;
