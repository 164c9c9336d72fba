//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, URLs absolute)
//! - Check that cache routes are usable as router patterns (absolute, unique)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use thiserror::Error;
use url::Url;

use crate::config::schema::{ProxyConfig, StorageConfig};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("upstream url {url:?} is invalid: {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("listener bind address must not be empty")]
    EmptyBindAddress,

    #[error("{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },

    #[error("cache route {0:?} must start with '/'")]
    InvalidCacheRoute(String),

    #[error("cache route {0:?} is listed more than once")]
    DuplicateCacheRoute(String),

    #[error("s3 storage requires a bucket name")]
    MissingBucket,

    #[error("local storage requires a cache directory")]
    MissingCacheDir,
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match Url::parse(&config.upstream.url) {
        Ok(url) if url.scheme() != "http" && url.scheme() != "https" => {
            errors.push(ValidationError::InvalidUpstream {
                url: config.upstream.url.clone(),
                reason: format!("unsupported scheme {:?}", url.scheme()),
            });
        }
        Ok(url) if url.host_str().is_none() => {
            errors.push(ValidationError::InvalidUpstream {
                url: config.upstream.url.clone(),
                reason: "missing host".to_string(),
            });
        }
        Ok(_) => {}
        Err(e) => errors.push(ValidationError::InvalidUpstream {
            url: config.upstream.url.clone(),
            reason: e.to_string(),
        }),
    }

    if config.listener.bind_address.trim().is_empty() {
        errors.push(ValidationError::EmptyBindAddress);
    }

    if config.upstream.timeout_secs == 0 {
        errors.push(ValidationError::ZeroTimeout { field: "upstream.timeout_secs" });
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::ZeroTimeout { field: "timeouts.request_secs" });
    }

    let mut seen = HashSet::new();
    for route in &config.cache.routes {
        if !route.starts_with('/') {
            errors.push(ValidationError::InvalidCacheRoute(route.clone()));
        } else if !seen.insert(route.as_str()) {
            errors.push(ValidationError::DuplicateCacheRoute(route.clone()));
        }
    }

    match &config.cache.storage {
        StorageConfig::S3 { bucket, .. } if bucket.trim().is_empty() => {
            errors.push(ValidationError::MissingBucket);
        }
        StorageConfig::Local { dir } if dir.as_os_str().is_empty() => {
            errors.push(ValidationError::MissingCacheDir);
        }
        _ => {}
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
