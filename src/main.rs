//! Caching reverse proxy for crates.io downloads.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ request id ─▶ logging spy ─▶ cacheable route?
//!                                                    │ yes        │ no
//!                                                    ▼            │
//!                                              cache lookup       │
//!                                               │hit   │miss      │
//!     Client Response                           │      ▼          ▼
//!     ◀─────────────────────────────────────────┘   capture ◀── upstream ◀── crates.io
//!                                                      │
//!                                                      ▼ status 200, complete body
//!                                               storage backend (disk / S3)
//! ```

use clap::Parser;

use crates_cache_proxy::cli::Cli;
use crates_cache_proxy::config::loader::{load_config, validate};
use crates_cache_proxy::lifecycle::{self, StartupError};
use crates_cache_proxy::observability::init_tracing;
use crates_cache_proxy::ProxyConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path).map_err(StartupError::Config)?,
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);

    init_tracing(&config.observability, cli.verbose);
    validate(&config).map_err(StartupError::Config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        upstream = %config.upstream.url,
        bind_address = %config.listener.bind_address,
        storage = ?config.cache.storage,
        "Started"
    );

    lifecycle::run(config).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
