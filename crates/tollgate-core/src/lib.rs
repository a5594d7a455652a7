//! # tollgate-core
//!
//! Idempotency primitives for at-most-once execution of side-effecting
//! requests.
//!
//! This crate provides:
//!
//! - **State store**: a bounded, TTL-evicting map from idempotency key to
//!   execution record, with atomic `begin_if_absent` / `complete` / `fail`
//!   transitions ([`store`])
//! - **Key issuer**: one server-issued key per session, refreshed after every
//!   protected mutation ([`issuer`])
//! - **Identifiers**: strongly-typed keys and session ids ([`id`])
//! - **Observability**: logging initialization and spans ([`observability`])
//!
//! The HTTP gate and handler adapter live in `tollgate-api`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod error;
pub mod id;
pub mod issuer;
pub mod observability;
pub mod store;

pub use error::{Error, Result};
pub use id::{IdempotencyKey, SessionId};
pub use issuer::KeyIssuer;
pub use store::{
    IdempotencyRecord, IdempotencyStore, KeyStatus, MemoryIdempotencyStore, RecordKey,
    StoreConfig, StoreStats,
};
