//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the proxy handler
//! - Put the cache middleware in front of cacheable routes
//! - Wire up middleware (request ID, request logging, panics, timeout)
//! - Bind server to listener and drain it on shutdown

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::any::Any;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
};

use crate::cache::{cache_middleware, CacheState};
use crate::config::ProxyConfig;
use crate::http::proxy::{proxy_handler, Upstream, UpstreamError};
use crate::observability::logging_middleware;
use crate::storage::CacheStore;

/// HTTP server for the caching proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration and cache store.
    pub fn new(config: ProxyConfig, store: Arc<dyn CacheStore>) -> Result<Self, UpstreamError> {
        let upstream = Arc::new(Upstream::new(&config.upstream)?);
        let router = Self::build_router(&config, upstream, CacheState::new(store));
        Ok(Self { router, config })
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// Layers run outermost first: request ID, request logging, panic
    /// catcher, timeout. The cache middleware sits innermost, on the
    /// cacheable routes only, so logged byte counts match what the client got.
    fn build_router(config: &ProxyConfig, upstream: Arc<Upstream>, cache: CacheState) -> Router {
        let mut router = Router::new();
        for route in &config.cache.routes {
            router = router.route(
                route,
                any(proxy_handler).layer(middleware::from_fn_with_state(
                    cache.clone(),
                    cache_middleware,
                )),
            );
        }

        router
            .fallback(proxy_handler)
            .with_state(upstream)
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(config.timeouts.request_secs),
            ))
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(middleware::from_fn(logging_middleware))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// The router, for driving the server without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server until `shutdown` fires, then drain open connections for
    /// at most `timeouts.shutdown_grace_secs`.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            routes = ?self.config.cache.routes,
            "HTTP server starting"
        );

        let draining = Arc::new(Notify::new());
        let drain_started = draining.clone();
        let grace = Duration::from_secs(self.config.timeouts.shutdown_grace_secs);

        let serve = axum::serve(listener, self.router).with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("Shutting down");
            drain_started.notify_one();
        })
        .into_future();

        tokio::select! {
            result = serve => result?,
            _ = async {
                draining.notified().await;
                tokio::time::sleep(grace).await;
            } => {
                tracing::warn!(grace_secs = grace.as_secs(), "Connections still open after grace period, closing");
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(error = %detail, "Handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, "Server Error").into_response()
}
