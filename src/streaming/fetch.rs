//! Asynchronous byte fetching for tile layers
//!
//! [`TileFetcher`] is the only network-facing seam of the crate. The loader
//! holds it behind an `Arc<dyn TileFetcher>`, so tests substitute scripted
//! fetchers and the CLI can read tiles from a local directory.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::core::error::Error;
use crate::core::types::Result;

/// Failure of a single fetch attempt
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("failed to decode image from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: image::ImageError,
    },

    #[error("{0}")]
    Other(String),
}

/// Boxed future returned by [`TileFetcher::fetch`]
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<Vec<u8>, FetchError>> + Send + 'a>>;

/// Fetches the raw bytes behind a URL
pub trait TileFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a>;
}

/// HTTP(S) fetcher backed by a shared reqwest client
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rtiview/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| Error::Runtime(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TileFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| FetchError::Http { url: url.to_string(), source })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status { url: url.to_string(), status: status.as_u16() });
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|source| FetchError::Http { url: url.to_string(), source })?;
            Ok(bytes.to_vec())
        })
    }
}

/// Reads tiles from the local filesystem.
///
/// Relative paths resolve against `root`; `file://` URLs are accepted.
#[derive(Clone, Debug)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for a URL or relative path
    pub fn resolve(&self, url: &str) -> PathBuf {
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl TileFetcher for FileFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let path = self.resolve(url);
            tokio::fs::read(&path)
                .await
                .map_err(|source| FetchError::Io { path, source })
        })
    }
}

/// Dispatches on the URL scheme: `http(s)://` goes to HTTP, everything else
/// to the filesystem
pub struct UrlFetcher {
    http: HttpFetcher,
    files: FileFetcher,
}

impl UrlFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self { http: HttpFetcher::new()?, files: FileFetcher::new(root) })
    }
}

impl TileFetcher for UrlFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.fetch(url)
        } else if url.contains("://") && !url.starts_with("file://") {
            Box::pin(async move { Err(FetchError::UnsupportedUrl(url.to_string())) })
        } else {
            self.files.fetch(url)
        }
    }
}
