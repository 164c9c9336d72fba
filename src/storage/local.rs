//! Filesystem-backed cache storage.
//!
//! Entries live at `<root>/<url-path>`, mirroring the request path as
//! directories. There is no index: the presence of a file is the entry.
//!
//! Keys are resolved lexically first, then checked again on disk with
//! symlinks followed, so a link inside the root cannot lead a read or write
//! outside it.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::observability::RequestLogger;
use crate::storage::{CacheStore, InitError, StorageError};

/// Cache storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    /// `root` with symlinks resolved, for on-disk containment checks.
    real_root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a cache rooted at `dir`.
    ///
    /// Relative paths are resolved against the current directory.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, InitError> {
        let dir = dir.as_ref();
        let absolute = std::path::absolute(dir).map_err(|source| InitError::CacheDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let root = normalize(&absolute);

        std::fs::create_dir_all(&root).map_err(|source| InitError::CacheDir {
            path: root.clone(),
            source,
        })?;
        let real_root = std::fs::canonicalize(&root).map_err(|source| InitError::CacheDir {
            path: root.clone(),
            source,
        })?;

        Ok(Self { root, real_root })
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a cache key onto a file below the root.
    ///
    /// The key is read as a `/`-separated path relative to the root. `..`
    /// segments are applied lexically and may never climb above the root.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let mut resolved = self.root.clone();
        let mut depth = 0usize;

        for segment in key.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if depth == 0 {
                        return Err(self.escapes(key));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                s if s.contains(['\0', '\\']) => {
                    return Err(StorageError::InvalidKey {
                        key: key.to_string(),
                        reason: "segment contains a NUL or backslash".to_string(),
                    });
                }
                s => {
                    resolved.push(s);
                    depth += 1;
                }
            }
        }

        if depth == 0 {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "resolves to the cache root itself".to_string(),
            });
        }

        if !resolved.starts_with(&self.root) {
            return Err(self.escapes(key));
        }

        Ok(resolved)
    }

    /// Check that `path`, with symlinks followed, still lies below the root.
    ///
    /// Missing trailing components are skipped: the deepest existing ancestor
    /// decides, since anything created below it inherits its location.
    async fn confine(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let mut existing = path;
        loop {
            match tokio::fs::canonicalize(existing).await {
                Ok(real) if real.starts_with(&self.real_root) => return Ok(()),
                Ok(_) => return Err(self.escapes(key)),
                Err(e) if e.kind() == ErrorKind::NotFound => match existing.parent() {
                    Some(parent) => existing = parent,
                    None => return Err(self.escapes(key)),
                },
                Err(source) => {
                    return Err(StorageError::Io {
                        path: existing.to_path_buf(),
                        source,
                    })
                }
            }
        }
    }

    fn escapes(&self, key: &str) -> StorageError {
        StorageError::EscapesRoot {
            key: key.to_string(),
            root: self.root.clone(),
        }
    }
}

#[async_trait]
impl CacheStore for LocalStore {
    async fn get(&self, logger: &RequestLogger, key: &str) -> Option<Bytes> {
        let resolved = match self.resolve(key) {
            Ok(path) => self.confine(key, &path).await.map(|()| path),
            Err(e) => Err(e),
        };
        let path = match resolved {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(
                    parent: logger.span(),
                    error = %e,
                    path = %key,
                    base_dir = %self.root.display(),
                    "Unable to determine the full path"
                );
                return None;
            }
        };

        match tokio::fs::read(&path).await {
            Ok(content) => Some(Bytes::from(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(
                    parent: logger.span(),
                    error = %e,
                    path = %path.display(),
                    "Unable to read the cached file"
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
        let path = self.resolve(key)?;
        let parent = path.parent().unwrap_or(&self.root);

        // Follow symlinks before creating anything below them.
        self.confine(key, &path).await?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;

        // Write beside the target and rename so readers never see a torn file.
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

        tokio::fs::write(&temp, &content)
            .await
            .map_err(|source| StorageError::Io {
                path: temp.clone(),
                source,
            })?;

        if let Err(source) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::Io { path, source });
        }

        tracing::debug!(
            parent: logger.span(),
            path = %path.display(),
            bytes = content.len(),
            "Cache updated"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

/// Lexically remove `.` and `..` components from an absolute path.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
