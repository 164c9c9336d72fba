//! Response caching subsystem.
//!
//! # Data Flow
//! ```text
//! GET request
//!     → cache key = escaped request path (query ignored)
//!     → CacheStore::get
//!         hit  → 200 + stored body, inner handler never runs
//!         miss → inner handler (the proxy)
//!                → capture.rs mirrors the body to the client and a buffer
//!                → once the body is complete with status 200:
//!                  CacheStore::put on a background task
//! ```
//!
//! # Design Decisions
//! - Stream first, decide to cache second: the client never waits on storage
//!   before receiving bytes, and storage failures never change the response
//! - Only bodies are stored, so hits carry no upstream headers
//! - Concurrent misses for one key are not coalesced; the last write wins

pub mod capture;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, Method, Uri},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::observability::metrics::{self, LookupOutcome};
use crate::observability::RequestLogger;
use crate::storage::CacheStore;

pub use capture::{Capture, CaptureBody};

/// State shared by every cached route.
#[derive(Clone)]
pub struct CacheState {
    store: Arc<dyn CacheStore>,
}

impl CacheState {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }
}

/// The key a request is cached under: its path, exactly as received.
pub fn cache_key(uri: &Uri) -> &str {
    uri.path()
}

/// Serve GET requests from the cache, filling it from the inner handler on a miss.
pub async fn cache_middleware(
    State(cache): State<CacheState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let logger = RequestLogger::from_request(&request);
    let key = cache_key(request.uri()).to_string();

    if let Some(content) = cache.store.get(&logger, &key).await {
        tracing::info!(
            parent: logger.span(),
            bytes = content.len(),
            path = %key,
            "Serving up a cached response"
        );
        metrics::record_cache_lookup(LookupOutcome::Hit);
        return Response::new(Body::from(content));
    }
    metrics::record_cache_lookup(LookupOutcome::Miss);

    let response = next.run(request).await;
    let (parts, body) = response.into_parts();

    let content_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let capture = Capture::new(
        cache.store.clone(),
        logger,
        key,
        parts.status,
        content_length,
    );
    Response::from_parts(parts, Body::new(CaptureBody::new(body, capture)))
}
