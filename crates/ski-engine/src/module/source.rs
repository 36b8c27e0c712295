//! Pluggable module source readers

use crate::host::{Fetch, FetchError, Request};
use std::fs;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Errors raised while reading module source
#[derive(Debug, Error)]
pub enum SourceError {
    /// Nothing exists at the URL
    #[error("{0} not found")]
    NotFound(String),

    /// The URL scheme has no reader
    #[error("scheme not supported {0}")]
    UnsupportedScheme(String),

    /// Reading failed for another reason
    #[error("read {url}: {message}")]
    Io {
        /// URL being read
        url: String,
        /// Underlying error
        message: String,
    },

    /// The fetch client failed
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Reads module source bytes for a resolved URL
pub trait SourceReader: Send + Sync {
    /// Read the source at `url`; `name` is the specifier as written, for messages
    fn read(&self, url: &Url, name: &str) -> Result<Vec<u8>, SourceError>;
}

/// Reads `file://` from disk and `http(s)://` through a [`Fetch`] client
#[derive(Clone, Default)]
pub struct DefaultSourceReader {
    fetch: Option<Arc<dyn Fetch>>,
}

impl DefaultSourceReader {
    /// Create a reader; without a fetch client `http(s)` is unsupported
    pub fn new(fetch: Option<Arc<dyn Fetch>>) -> Self {
        Self { fetch }
    }

    fn read_file(&self, url: &Url) -> Result<Vec<u8>, SourceError> {
        let path = url
            .to_file_path()
            .map_err(|_| SourceError::NotFound(url.to_string()))?;
        if path.is_dir() {
            return Err(SourceError::NotFound(url.to_string()));
        }
        fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => SourceError::NotFound(url.to_string()),
            _ => SourceError::Io {
                url: url.to_string(),
                message: err.to_string(),
            },
        })
    }

    fn read_http(&self, url: &Url) -> Result<Vec<u8>, SourceError> {
        let fetch = self
            .fetch
            .as_ref()
            .ok_or_else(|| SourceError::UnsupportedScheme(url.scheme().to_string()))?;
        let response = fetch.send(Request::get(url.as_str()))?;
        match response.status {
            404 | 410 => Err(SourceError::NotFound(url.to_string())),
            _ if response.ok() => Ok(response.body),
            status => Err(SourceError::Io {
                url: url.to_string(),
                message: format!("unexpected status {} {}", status, response.status_text),
            }),
        }
    }
}

impl SourceReader for DefaultSourceReader {
    fn read(&self, url: &Url, name: &str) -> Result<Vec<u8>, SourceError> {
        debug!(url = %url, name, "reading module source");
        match url.scheme() {
            "file" => self.read_file(url),
            "http" | "https" => self.read_http(url),
            scheme => Err(SourceError::UnsupportedScheme(scheme.to_string())),
        }
    }
}
