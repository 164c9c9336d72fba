//! Command line interface.
//!
//! Every flag can also be set through the environment variable named next to
//! it. Flags take precedence over the configuration file.

use clap::Parser;
use std::path::PathBuf;

use crate::config::{ProxyConfig, StorageConfig};

#[derive(Debug, Parser)]
#[command(name = "crates-cache-proxy")]
#[command(about = "Caching reverse proxy for crates.io downloads", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, env = "VERBOSE")]
    pub verbose: bool,

    /// Upstream origin to forward requests to
    #[arg(short, long, env = "UPSTREAM")]
    pub upstream: Option<String>,

    /// Host to listen on
    #[arg(short = 'H', long, env = "HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Store cache entries in this S3 bucket instead of on disk
    #[arg(short, long, env = "BUCKET")]
    pub bucket: Option<String>,

    /// Directory to store cache entries in
    #[arg(short, long, env = "CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
}

impl Cli {
    /// Layer the command line on top of a loaded configuration.
    ///
    /// A bucket wins over a cache directory when both are given.
    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(upstream) = &self.upstream {
            config.upstream.url = upstream.clone();
        }

        if self.host.is_some() || self.port.is_some() {
            let current = config.listener.bind_address.as_str();
            let (host, port) = match current.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.to_string()),
                None => (current.to_string(), "8080".to_string()),
            };
            let host = self.host.clone().unwrap_or(host);
            let port = self.port.map(|p| p.to_string()).unwrap_or(port);
            config.listener.bind_address = format!("{host}:{port}");
        }

        if let Some(dir) = &self.cache_dir {
            config.cache.storage = StorageConfig::Local { dir: dir.clone() };
        }

        if let Some(bucket) = &self.bucket {
            let prefix = match &config.cache.storage {
                StorageConfig::S3 { prefix, .. } => prefix.clone(),
                StorageConfig::Local { .. } => None,
            };
            config.cache.storage = StorageConfig::S3 {
                bucket: bucket.clone(),
                prefix,
            };
        }
    }
}
