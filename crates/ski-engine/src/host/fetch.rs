//! Fetch contract
//!
//! The HTTP client itself lives outside the engine. The engine only needs
//! it to read `http(s)://` module sources; script-facing HTTP bindings
//! reach it through the `ski:http` host module.

use thiserror::Error;

/// An outgoing HTTP request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Request method, upper case
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Header name/value pairs in insertion order
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Option<Vec<u8>>,
}

impl Request {
    /// Create a request with the given method and URL
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Create a GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// First header value with the given name, compared case-insensitively
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A received HTTP response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Status code
    pub status: u16,
    /// Canonical reason phrase
    pub status_text: String,
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
    /// Body bytes
    pub body: Vec<u8>,
}

impl Response {
    /// Whether the status is in the 2xx range
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, lossily
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// First header value with the given name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Errors raised by a [`Fetch`] implementation
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The request could not be built
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request was sent but failed in transit
    #[error("request failed: {0}")]
    Transport(String),

    /// No response before the client timeout
    #[error("request timed out: {0}")]
    Timeout(String),
}

/// Performs HTTP requests
pub trait Fetch: Send + Sync {
    /// Send `request` and wait for the full response
    fn send(&self, request: Request) -> Result<Response, FetchError>;
}
