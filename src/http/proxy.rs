//! Upstream forwarding.
//!
//! # Responsibilities
//! - Rewrite the request URI onto the upstream origin
//! - Pass headers through, minus hop-by-hop headers and `Host`
//! - Stream request and response bodies without buffering
//! - Map transport failures to `502 Bad Gateway`
//!
//! # Design Decisions
//! - Redirects are followed by the client, so a redirecting download
//!   endpoint yields the final body (which is what gets cached)
//! - A cookie store is kept for the lifetime of the client

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use http_body::Body as HttpBody;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

use crate::config::UpstreamConfig;
use crate::observability::metrics;
use crate::observability::RequestLogger;

/// Errors building the upstream client.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unable to build the HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Headers that only apply to a single connection.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Client for the origin every request is forwarded to.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base: Url,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let base = Url::parse(&config.url)?;
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, base })
    }

    /// Upstream URL for an incoming request URI: origin of the base, path and
    /// query of the request.
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.base.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        url
    }

    /// Send `request` upstream and stream the answer back.
    pub async fn forward(&self, logger: &RequestLogger, request: Request) -> Response {
        let start = Instant::now();
        let (parts, body) = request.into_parts();
        let method = parts.method;
        let url = self.target_url(&parts.uri);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        tracing::debug!(
            parent: logger.span(),
            url = %url,
            request_headers = ?headers,
            "Proxying request to upstream"
        );

        let mut upstream_request = self.client.request(method.clone(), url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            upstream_request =
                upstream_request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream_response = match upstream_request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(parent: logger.span(), error = %e, "Unable to send the request");
                metrics::record_request(method.as_str(), 502, start);
                return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
            }
        };

        let status = upstream_response.status();
        tracing::debug!(
            parent: logger.span(),
            status = status.as_u16(),
            headers = ?upstream_response.headers(),
            "Receiving response from upstream"
        );
        metrics::record_request(method.as_str(), status.as_u16(), start);

        let mut headers = upstream_response.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// Plain proxy handler, used for every route and as the router fallback.
pub async fn proxy_handler(State(upstream): State<Arc<Upstream>>, request: Request) -> Response {
    let logger = RequestLogger::from_request(&request);
    upstream.forward(&logger, request).await
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
