//! Fetcher abstraction.
//!
//! A fetcher resolves the `key` half of a fetch key to a byte stream. The
//! dispatcher only ever sees the opaque id; workers look the fetcher up in a
//! [`FetcherRegistry`](crate::FetcherRegistry) and call [`Fetcher::fetch`].

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("invalid fetch key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether a retry may succeed. Missing sources and malformed keys will
    /// not change on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unreachable(_) | FetchError::Io(_))
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// The id this fetcher is registered under.
    fn id(&self) -> &str;

    /// Resolve `key` to the raw bytes of the source document.
    async fn fetch(&self, key: &str) -> FetchResult<Vec<u8>>;
}

/// Reads documents from a base directory. Keys are relative paths; anything
/// escaping the base directory is rejected.
pub struct FileSystemFetcher {
    id: String,
    base_dir: PathBuf,
}

impl FileSystemFetcher {
    pub fn new(id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, key: &str) -> FetchResult<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|part| matches!(part, Component::ParentDir))
        {
            return Err(FetchError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl Fetcher for FileSystemFetcher {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, key: &str) -> FetchResult<Vec<u8>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(key.to_string()))
            }
            Err(err) => Err(FetchError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetches_relative_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"hello").unwrap();

        let fetcher = FileSystemFetcher::new("fs", dir.path());
        assert_eq!(fetcher.fetch("docs/a.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FileSystemFetcher::new("fs", dir.path());
        assert!(matches!(
            fetcher.fetch("nope.txt").await,
            Err(FetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FileSystemFetcher::new("fs", dir.path());
        assert!(matches!(
            fetcher.fetch("../etc/passwd").await,
            Err(FetchError::InvalidKey(_))
        ));
        assert!(matches!(
            fetcher.fetch("/etc/passwd").await,
            Err(FetchError::InvalidKey(_))
        ));
    }

    #[test]
    fn transient_classification() {
        assert!(FetchError::Unreachable("host down".into()).is_transient());
        assert!(!FetchError::NotFound("a".into()).is_transient());
        assert!(!FetchError::InvalidKey("a".into()).is_transient());
    }
}
