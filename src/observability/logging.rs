//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Give every request its own logger (a span carrying the request ID)
//! - Log one summary line per served request
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - Log level configurable via config and environment
//! - The request logger is passed explicitly to the cache and storage layers

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{header, Method, StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use http_body::{Body as HttpBody, Frame, SizeHint};
use pin_project::{pin_project, pinned_drop};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{Instrument, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};
use crate::http::X_REQUEST_ID;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level; `verbose` forces debug output
/// for this crate.
pub fn init_tracing(config: &ObservabilityConfig, verbose: bool) {
    let default_directive = if verbose {
        "crates_cache_proxy=debug,tower_http=debug".to_string()
    } else {
        format!("crates_cache_proxy={},tower_http=info", config.log_level)
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }
}

/// Logger scoped to a single request.
///
/// Every event emitted through it is parented to the request span, so the
/// request ID, method and URI travel with cache and storage log lines.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    span: Span,
}

impl RequestLogger {
    /// Create a logger for one request.
    pub fn new(request_id: &str, method: &Method, uri: &Uri) -> Self {
        Self {
            span: tracing::info_span!(
                "request",
                request_id = %request_id,
                method = %method,
                uri = %uri,
            ),
        }
    }

    /// A logger that is not attached to any request.
    pub fn detached() -> Self {
        Self { span: Span::none() }
    }

    /// The span events should be parented to.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Fetch the logger attached by [`logging_middleware`], or a detached one.
    pub fn from_request<B>(request: &axum::http::Request<B>) -> Self {
        request
            .extensions()
            .get::<RequestLogger>()
            .cloned()
            .unwrap_or_else(|| {
                tracing::debug!(uri = %request.uri(), "Request has no logger attached");
                Self::detached()
            })
    }
}

/// Attach a [`RequestLogger`] to the request and log a summary once the
/// response body has been delivered (or abandoned).
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let logger = RequestLogger::new(&request_id, request.method(), request.uri());
    request.extensions_mut().insert(logger.clone());

    let summary = RequestSummary {
        logger: logger.clone(),
        method: request.method().clone(),
        uri: request.uri().clone(),
        user_agent: request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        start: Instant::now(),
        status: StatusCode::OK,
        bytes_written: 0,
    };

    let response = next.run(request).instrument(logger.span().clone()).await;

    let (parts, body) = response.into_parts();
    let summary = RequestSummary {
        status: parts.status,
        ..summary
    };
    Response::from_parts(parts, Body::new(SpyBody::new(body, summary)))
}

struct RequestSummary {
    logger: RequestLogger,
    method: Method,
    uri: Uri,
    user_agent: String,
    start: Instant,
    status: StatusCode,
    bytes_written: u64,
}

impl RequestSummary {
    fn log(&self, completed: bool) {
        tracing::info!(
            parent: self.logger.span(),
            response_code = self.status.as_u16(),
            bytes_written = self.bytes_written,
            url = %self.uri,
            method = %self.method,
            duration = ?self.start.elapsed(),
            user_agent = %self.user_agent,
            completed,
            "Served a request"
        );
    }
}

/// Response body decorator counting the bytes handed to the client.
///
/// The summary is logged exactly once, when the body is dropped, so aborted
/// transfers are reported with `completed = false`.
#[pin_project(PinnedDrop)]
pub struct SpyBody<B> {
    #[pin]
    inner: B,
    summary: RequestSummary,
    completed: bool,
}

impl<B> SpyBody<B> {
    fn new(inner: B, summary: RequestSummary) -> Self {
        Self {
            inner,
            summary,
            completed: false,
        }
    }
}

impl<B> HttpBody for SpyBody<B>
where
    B: HttpBody<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.summary.bytes_written += data.len() as u64;
                }
                // Sized bodies are not polled again once their last frame is out.
                if this.inner.is_end_stream() {
                    *this.completed = true;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                *this.completed = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl<B> PinnedDrop for SpyBody<B> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.summary.log(*this.completed);
    }
}
