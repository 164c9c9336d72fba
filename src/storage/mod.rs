//! Cache storage subsystem.
//!
//! # Data Flow
//! ```text
//! cache middleware
//!     → CacheStore::get(key)   (miss on any failure, logged)
//!     → CacheStore::put(key)   (failure returned to the caller)
//!
//! Backends:
//!     local.rs  → files below a cache root, mirroring the URL path
//!     object.rs → objects in an S3-compatible bucket
//! ```
//!
//! # Design Decisions
//! - One trait, chosen once at startup and shared behind an `Arc`
//! - Keys are the raw (still escaped) request path
//! - Only bodies are stored; no headers, status or timestamps
//! - Entries are overwritten, never evicted

pub mod local;
pub mod object;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::observability::RequestLogger;

pub use local::LocalStore;
pub use object::ObjectStoreBackend;

/// Errors from a single storage operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The key resolves to a location outside the cache root.
    #[error("key {key:?} escapes the cache root {}", root.display())]
    EscapesRoot { key: String, root: PathBuf },

    /// The key cannot be mapped to a storage location.
    #[error("invalid cache key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("unable to create the {} directory: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

/// Errors constructing a storage backend. Fatal at startup.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("unable to create the cache directory {}: {source}", path.display())]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to initialize the object store session: {0}")]
    ObjectStore(#[from] object_store::Error),
}

/// Byte store addressed by request path.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up the entry for `key`.
    ///
    /// Absent entries and read failures both yield `None`; failures are
    /// logged through `logger`, never returned.
    async fn get(&self, logger: &RequestLogger, key: &str) -> Option<Bytes>;

    /// Store `content` under `key`, replacing any previous entry.
    async fn put(
        &self,
        logger: &RequestLogger,
        key: &str,
        content: Bytes,
    ) -> Result<(), StorageError>;

    /// Human readable location, for startup logs.
    fn describe(&self) -> String;
}

/// Build the configured backend.
pub fn build_store(config: &StorageConfig) -> Result<Arc<dyn CacheStore>, InitError> {
    let store: Arc<dyn CacheStore> = match config {
        StorageConfig::Local { dir } => Arc::new(LocalStore::new(dir)?),
        StorageConfig::S3 { bucket, prefix } => {
            Arc::new(ObjectStoreBackend::s3(bucket, prefix.as_deref())?)
        }
    };

    tracing::info!(storage = %store.describe(), "Cache storage initialized");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("cache");
        let store = build_store(&StorageConfig::Local { dir: root.clone() }).unwrap();

        assert!(root.is_dir());
        let logger = RequestLogger::detached();
        store
            .put(&logger, "/a/b", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(store.get(&logger, "/a/b").await.unwrap(), "abc");
    }

    #[test]
    fn test_build_local_store_on_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = build_store(&StorageConfig::Local {
            dir: file.path().join("cache"),
        });
        assert!(matches!(result, Err(InitError::CacheDir { .. })));
    }
}
