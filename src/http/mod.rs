//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, logging, timeout)
//!     → cacheable route? → cache middleware (crate::cache)
//!     → proxy.rs (forward to upstream, stream response back)
//!     → Send to client
//! ```

pub mod proxy;
pub mod server;

use axum::http::HeaderName;

/// Header carrying the per-request correlation ID.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub use proxy::{proxy_handler, Upstream, UpstreamError};
pub use server::HttpServer;
