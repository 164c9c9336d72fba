//! Object-store-backed cache storage (S3 and compatibles).

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;

use crate::observability::RequestLogger;
use crate::storage::{CacheStore, InitError, StorageError};

/// Longest key S3 accepts, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Cache storage in an object-store bucket.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: Path,
}

impl ObjectStoreBackend {
    /// Wrap an existing store. `bucket` is only used for logging.
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: Path) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix,
        }
    }

    /// Connect to an S3 bucket. Credentials, region and endpoint are read
    /// from the standard `AWS_*` environment variables.
    pub fn s3(bucket: &str, prefix: Option<&str>) -> Result<Self, InitError> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()?;

        let prefix = match prefix {
            Some(prefix) => Path::parse(prefix).map_err(|e| {
                InitError::ObjectStore(object_store::Error::InvalidPath { source: e })
            })?,
            None => Path::default(),
        };

        Ok(Self::new(Arc::new(store), bucket, prefix))
    }

    /// Map a cache key onto an object location.
    pub fn location(&self, key: &str) -> Result<Path, StorageError> {
        let invalid = |reason: String| StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        };

        let relative = Path::parse(key).map_err(|e| invalid(e.to_string()))?;
        if relative.as_ref().is_empty() {
            return Err(invalid("refers to the bucket root".to_string()));
        }

        let location: Path = self.prefix.parts().chain(relative.parts()).collect();
        if location.as_ref().len() > MAX_KEY_LEN {
            return Err(invalid(format!("longer than {MAX_KEY_LEN} bytes")));
        }

        Ok(location)
    }
}

#[async_trait]
impl CacheStore for ObjectStoreBackend {
    async fn get(&self, logger: &RequestLogger, key: &str) -> Option<Bytes> {
        let location = match self.location(key) {
            Ok(location) => location,
            Err(e) => {
                tracing::warn!(
                    parent: logger.span(),
                    error = %e,
                    path = %key,
                    bucket = %self.bucket,
                    "Unable to map the key to an object"
                );
                return None;
            }
        };

        let result = match self.store.get(&location).await {
            Ok(result) => result.bytes().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(content) => Some(content),
            Err(object_store::Error::NotFound { .. }) => {
                tracing::debug!(
                    parent: logger.span(),
                    object = %location,
                    bucket = %self.bucket,
                    "Object not cached"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    parent: logger.span(),
                    error = %e,
                    object = %location,
                    bucket = %self.bucket,
                    "Object store unavailable, treating as a cache miss"
                );
                None
            }
        }
    }

    async fn put(
        &self,
        logger: &RequestLogger,
        key: &str,
        content: Bytes,
    ) -> Result<(), StorageError> {
        let location = self.location(key)?;
        let bytes = content.len();

        self.store
            .put(&location, PutPayload::from(content))
            .await?;

        tracing::debug!(
            parent: logger.span(),
            object = %location,
            bucket = %self.bucket,
            bytes,
            "Cache updated"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        if self.prefix.as_ref().is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }
}
