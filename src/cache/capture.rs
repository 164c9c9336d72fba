//! Response body capture.
//!
//! [`CaptureBody`] sits between the proxied response body and the client.
//! Every frame is handed on unchanged while data frames are also appended to
//! an in-memory copy. Once the body is complete the copy is committed to the
//! cache store on a background task, provided the response status was exactly
//! `200 OK` and the length matches any declared `Content-Length`.

use axum::body::Bytes;
use axum::http::StatusCode;
use bytes::BytesMut;
use http_body::{Body as HttpBody, Frame, SizeHint};
use pin_project::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use crate::observability::metrics::{self, WriteResult};
use crate::observability::RequestLogger;
use crate::storage::CacheStore;

/// Everything needed to commit a captured body once it is complete.
pub struct Capture {
    store: Arc<dyn CacheStore>,
    logger: RequestLogger,
    key: String,
    status: StatusCode,
    content_length: Option<u64>,
    buffer: BytesMut,
}

impl Capture {
    pub fn new(
        store: Arc<dyn CacheStore>,
        logger: RequestLogger,
        key: String,
        status: StatusCode,
        content_length: Option<u64>,
    ) -> Self {
        Self {
            store,
            logger,
            key,
            status,
            content_length,
            buffer: BytesMut::new(),
        }
    }

    fn append(&mut self, data: &Bytes) {
        self.buffer.extend_from_slice(data);
    }

    /// Whether the declared `Content-Length` has been fully received.
    fn is_complete(&self) -> bool {
        self.content_length == Some(self.buffer.len() as u64)
    }

    /// Write the captured body to the store if it is cacheable.
    pub async fn commit(self) {
        let Capture {
            store,
            logger,
            key,
            status,
            content_length,
            buffer,
        } = self;

        if status != StatusCode::OK {
            tracing::info!(
                parent: logger.span(),
                status_code = status.as_u16(),
                status_text = status.canonical_reason().unwrap_or_default(),
                path = %key,
                "Not caching the result because the server didn't reply with a 200 OK"
            );
            metrics::record_cache_write(WriteResult::Skipped);
            return;
        }

        if let Some(expected) = content_length {
            if buffer.len() as u64 != expected {
                tracing::info!(
                    parent: logger.span(),
                    expected,
                    received = buffer.len(),
                    path = %key,
                    "Not caching a body that does not match its Content-Length"
                );
                metrics::record_cache_write(WriteResult::Skipped);
                return;
            }
        }

        match store.put(&logger, &key, buffer.freeze()).await {
            Ok(()) => metrics::record_cache_write(WriteResult::Ok),
            Err(e) => {
                tracing::warn!(
                    parent: logger.span(),
                    error = %e,
                    path = %key,
                    "Unable to update the cache"
                );
                metrics::record_cache_write(WriteResult::Error);
            }
        }
    }
}

/// Hand the capture to a background task. The client never waits on storage.
fn start_commit(slot: &mut Option<Capture>) {
    if let Some(capture) = slot.take() {
        tokio::spawn(capture.commit());
    }
}

/// Response body that mirrors its frames into a [`Capture`].
///
/// The commit starts as soon as the body is known to be complete: either the
/// declared `Content-Length` has been seen or the inner body reports its end.
/// HTTP/1 servers stop polling a sized body once its length is written, so
/// waiting for a trailing `None` would never commit those responses. A body
/// dropped before it is complete is never committed.
#[pin_project]
pub struct CaptureBody<B> {
    #[pin]
    inner: B,
    capture: Option<Capture>,
}

impl<B: HttpBody> CaptureBody<B> {
    pub fn new(inner: B, capture: Capture) -> Self {
        let mut capture = Some(capture);
        if inner.is_end_stream() || capture.as_ref().is_some_and(Capture::is_complete) {
            start_commit(&mut capture);
        }
        Self { inner, capture }
    }
}

impl<B> HttpBody for CaptureBody<B>
where
    B: HttpBody<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        match ready!(this.inner.as_mut().poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(capture) = this.capture.as_mut() {
                    if let Some(data) = frame.data_ref() {
                        capture.append(data);
                    }
                    if capture.is_complete() || this.inner.is_end_stream() {
                        start_commit(this.capture);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                if let Some(capture) = this.capture.take() {
                    tracing::warn!(
                        parent: capture.logger.span(),
                        error = %e,
                        path = %capture.key,
                        "Not caching a response whose body failed mid-stream"
                    );
                    metrics::record_cache_write(WriteResult::Skipped);
                }
                Poll::Ready(Some(Err(e)))
            }
            None => {
                start_commit(this.capture);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.capture.is_none() || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use axum::body::Body;
    use futures_util::stream;
    use http_body_util::BodyExt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        puts: Mutex<Vec<(String, Bytes)>>,
        fail: bool,
    }

    #[async_trait]
    impl CacheStore for RecordingStore {
        async fn get(&self, _logger: &RequestLogger, _key: &str) -> Option<Bytes> {
            None
        }

        async fn put(
            &self,
            _logger: &RequestLogger,
            key: &str,
            content: Bytes,
        ) -> Result<(), StorageError> {
            self.puts.lock().unwrap().push((key.to_string(), content));
            if self.fail {
                Err(StorageError::InvalidKey {
                    key: key.to_string(),
                    reason: "store offline".to_string(),
                })
            } else {
                Ok(())
            }
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }

    fn capture(store: &Arc<RecordingStore>, status: StatusCode, len: Option<u64>) -> Capture {
        Capture::new(
            store.clone(),
            RequestLogger::detached(),
            "/key".to_string(),
            status,
            len,
        )
    }

    fn chunked(chunks: &[&'static str]) -> Body {
        let frames: Vec<Result<Bytes, std::io::Error>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Body::from_stream(stream::iter(frames))
    }

    /// Commits run on their own task; give them a moment to land.
    async fn puts_after_commit(store: &RecordingStore) -> Vec<(String, Bytes)> {
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let puts = store.puts.lock().unwrap();
            if !puts.is_empty() {
                return puts.clone();
            }
        }
        Vec::new()
    }

    #[tokio::test]
    async fn test_streams_and_commits_on_200() {
        let store = Arc::new(RecordingStore::default());
        let body = CaptureBody::new(
            chunked(&["PKG", "-", "BYTES"]),
            capture(&store, StatusCode::OK, None),
        );

        let delivered = body.collect().await.unwrap().to_bytes();
        assert_eq!(delivered, "PKG-BYTES");

        let puts = puts_after_commit(&store).await;
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "/key");
        assert_eq!(puts[0].1, "PKG-BYTES");
    }

    #[tokio::test]
    async fn test_commits_when_content_length_reached() {
        // A sized body is not polled past its length, so the commit cannot
        // wait for the trailing end-of-stream.
        let store = Arc::new(RecordingStore::default());
        let mut body = CaptureBody::new(
            chunked(&["PKG-", "BYTES", "never read"]),
            capture(&store, StatusCode::OK, Some(9)),
        );

        assert_eq!(body.frame().await.unwrap().unwrap().into_data().unwrap(), "PKG-");
        assert!(!body.is_end_stream());
        assert_eq!(body.frame().await.unwrap().unwrap().into_data().unwrap(), "BYTES");
        assert!(body.is_end_stream());
        drop(body);

        let puts = puts_after_commit(&store).await;
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].1, "PKG-BYTES");
    }

    #[tokio::test]
    async fn test_empty_body_commits_without_polling() {
        let store = Arc::new(RecordingStore::default());
        let body = CaptureBody::new(Body::empty(), capture(&store, StatusCode::OK, Some(0)));
        assert!(body.is_end_stream());

        let puts = puts_after_commit(&store).await;
        assert_eq!(puts.len(), 1);
        assert!(puts[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_non_200_is_streamed_but_not_committed() {
        let store = Arc::new(RecordingStore::default());
        let body = CaptureBody::new(
            Body::from("not found"),
            capture(&store, StatusCode::NOT_FOUND, None),
        );

        let delivered = body.collect().await.unwrap().to_bytes();
        assert_eq!(delivered, "not found");
        assert!(puts_after_commit(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_does_not_affect_client() {
        let store = Arc::new(RecordingStore {
            fail: true,
            ..Default::default()
        });
        let body = CaptureBody::new(
            chunked(&["a", "b", "c"]),
            capture(&store, StatusCode::OK, None),
        );

        let delivered = body.collect().await.unwrap().to_bytes();
        assert_eq!(delivered, "abc");
        assert_eq!(puts_after_commit(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_short_body_against_content_length_is_skipped() {
        let store = Arc::new(RecordingStore::default());
        let body = CaptureBody::new(
            Body::from("short"),
            capture(&store, StatusCode::OK, Some(100)),
        );

        let delivered = body.collect().await.unwrap().to_bytes();
        assert_eq!(delivered, "short");
        assert!(puts_after_commit(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_body_is_never_committed() {
        let store = Arc::new(RecordingStore::default());
        let mut body = CaptureBody::new(
            chunked(&["first", "second"]),
            capture(&store, StatusCode::OK, Some(11)),
        );

        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first, "first");
        drop(body);

        assert!(puts_after_commit(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_body_error_is_forwarded_and_not_committed() {
        let store = Arc::new(RecordingStore::default());
        let frames = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("upstream reset")),
        ]);
        let body = CaptureBody::new(
            Body::from_stream(frames),
            capture(&store, StatusCode::OK, None),
        );

        assert!(body.collect().await.is_err());
        assert!(puts_after_commit(&store).await.is_empty());
    }
}
