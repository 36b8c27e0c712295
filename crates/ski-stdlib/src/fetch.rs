//! Blocking HTTP client implementing the engine's [`Fetch`] contract

use dashmap::DashMap;
use reqwest::blocking::Client;
use reqwest::{Method, Proxy};
use ski_engine::host::{FetchError, Request, Response};
use ski_engine::Fetch;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default `User-Agent` header
pub const DEFAULT_USER_AGENT: &str = concat!("ski/", env!("CARGO_PKG_VERSION"));

/// Client settings
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Whole-request timeout
    pub timeout: Duration,
    /// `User-Agent` sent with every request
    pub user_agent: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

struct Rotation {
    proxies: Vec<String>,
    next: AtomicUsize,
}

/// Per-host proxy lists, handed out round-robin
#[derive(Default)]
pub struct ProxyTable {
    hosts: DashMap<String, Rotation>,
}

impl ProxyTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Route requests for the host of `target` (a URL or a bare host name)
    /// through `proxies` in turn. An empty list removes the entry.
    pub fn set(&self, target: &str, proxies: Vec<String>) -> Result<(), FetchError> {
        for proxy in &proxies {
            Url::parse(proxy)
                .map_err(|err| FetchError::InvalidRequest(format!("proxy {}: {}", proxy, err)))?;
        }
        let host = host_key(target);
        if proxies.is_empty() {
            self.hosts.remove(&host);
        } else {
            self.hosts.insert(
                host,
                Rotation {
                    proxies,
                    next: AtomicUsize::new(0),
                },
            );
        }
        Ok(())
    }

    /// Next proxy for `host`, if the host has any
    pub fn next(&self, host: &str) -> Option<String> {
        let rotation = self.hosts.get(&host.to_ascii_lowercase())?;
        let index = rotation.next.fetch_add(1, Ordering::Relaxed) % rotation.proxies.len();
        Some(rotation.proxies[index].clone())
    }
}

fn host_key(target: &str) -> String {
    Url::parse(target)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| target.trim().to_string())
        .to_ascii_lowercase()
}

/// [`Fetch`] over a blocking `reqwest` client, with per-host proxies
pub struct HttpFetch {
    options: FetchOptions,
    direct: Client,
    /// One client per proxy URL; reqwest binds proxies at build time
    proxied: DashMap<String, Client>,
    proxies: Arc<ProxyTable>,
}

impl HttpFetch {
    /// Create a client
    pub fn new(options: FetchOptions, proxies: Arc<ProxyTable>) -> Result<Self, FetchError> {
        let direct = build_client(&options, None)?;
        Ok(Self {
            options,
            direct,
            proxied: DashMap::new(),
            proxies,
        })
    }

    /// The proxy table consulted for every request
    pub fn proxies(&self) -> &Arc<ProxyTable> {
        &self.proxies
    }

    /// Rotate requests for the host of `target` through `proxies`
    pub fn set_proxy(&self, target: &str, proxies: Vec<String>) -> Result<(), FetchError> {
        self.proxies.set(target, proxies)
    }

    fn client_for(&self, url: &Url) -> Result<Client, FetchError> {
        let Some(proxy) = url.host_str().and_then(|host| self.proxies.next(host)) else {
            return Ok(self.direct.clone());
        };
        debug!(url = %url, proxy = %proxy, "using proxy");
        if let Some(client) = self.proxied.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.options, Some(&proxy))?;
        self.proxied.insert(proxy, client.clone());
        Ok(client)
    }
}

fn build_client(options: &FetchOptions, proxy: Option<&str>) -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .timeout(options.timeout)
        .user_agent(options.user_agent.as_str());
    if let Some(proxy) = proxy {
        let proxy = Proxy::all(proxy).map_err(|err| FetchError::InvalidRequest(err.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|err| FetchError::Transport(err.to_string()))
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(err.to_string())
    } else if err.is_builder() {
        FetchError::InvalidRequest(err.to_string())
    } else {
        FetchError::Transport(err.to_string())
    }
}

impl Fetch for HttpFetch {
    fn send(&self, request: Request) -> Result<Response, FetchError> {
        let url = Url::parse(&request.url)
            .map_err(|err| FetchError::InvalidRequest(format!("{}: {}", request.url, err)))?;
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("method {:?}", request.method)))?;

        let client = self.client_for(&url)?;
        let mut builder = client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().map_err(transport_error)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().map_err(transport_error)?.to_vec();

        Ok(Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_round_robin_per_host() {
        let table = ProxyTable::new();
        table
            .set(
                "https://Example.com/path",
                vec!["http://p1:8080".into(), "http://p2:8080".into()],
            )
            .unwrap();

        assert_eq!(table.next("example.com").as_deref(), Some("http://p1:8080"));
        assert_eq!(table.next("example.com").as_deref(), Some("http://p2:8080"));
        assert_eq!(table.next("example.com").as_deref(), Some("http://p1:8080"));
        assert!(table.next("other.org").is_none());
    }

    #[test]
    fn test_proxy_table_accepts_bare_host_and_clears() {
        let table = ProxyTable::new();
        table.set("api.test", vec!["socks5://p:1080".into()]).unwrap();
        assert!(table.next("api.test").is_some());
        table.set("api.test", Vec::new()).unwrap();
        assert!(table.next("api.test").is_none());
    }

    #[test]
    fn test_invalid_proxy_is_rejected() {
        let table = ProxyTable::new();
        assert!(matches!(
            table.set("example.com", vec!["not a url".into()]),
            Err(FetchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_invalid_request_is_rejected_before_sending() {
        let fetch = HttpFetch::new(FetchOptions::default(), Arc::new(ProxyTable::new())).unwrap();
        assert!(matches!(
            fetch.send(Request::get("not a url")),
            Err(FetchError::InvalidRequest(_))
        ));
        assert!(matches!(
            fetch.send(Request::new("BAD METHOD", "http://example.com/")),
            Err(FetchError::InvalidRequest(_))
        ));
    }
}
