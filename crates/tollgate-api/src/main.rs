//! `tollgate-api` binary entrypoint.
//!
//! Loads configuration from environment variables and starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;

use tollgate_api::config::Config;
use tollgate_api::server::Server;
use tollgate_core::observability::{LogFormat, init_logging};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    init_logging(choose_log_format(&config));

    tracing::info!(
        max_entries = config.idempotency.max_entries,
        ttl_secs = config.idempotency.ttl_secs,
        bind_to_session = config.idempotency.bind_to_session,
        "Using in-memory idempotency store"
    );

    let server = Server::new(config);
    server.serve().await?;
    Ok(())
}
