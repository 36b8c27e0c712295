//! Ski Standard Library
//!
//! Host modules and globals available to every Ski script:
//! - `ski:cache`: key/value store with optional expiry ([`CacheModule`])
//! - `ski:http`: promise-based HTTP client with templates and per-host
//!   proxies ([`HttpModule`])
//! - `ski:shortener`: request templates stored under short ids
//!   ([`ShortenerModule`])
//! - `parser:regex`: regular-expression content extraction ([`RegexParser`])
//! - `console`: output forwarded to `tracing` ([`ConsoleGlobal`])
//! - `setTimeout` / `clearTimeout` / `sleep` ([`TimersGlobal`])
//! - `URLSearchParams` ([`SearchParamsGlobal`])
//!
//! [`Stdlib`] builds the shared backing services once and registers all of
//! them on a [`ModuleRegistry`].

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod console;
pub mod fetch;
pub mod http;
pub mod regex_parser;
pub mod search_params;
pub mod shortener;
pub mod template;
pub mod timers;

pub use cache::{parse_ttl, CacheModule, MemoryCache};
pub use console::ConsoleGlobal;
pub use fetch::{FetchOptions, HttpFetch, ProxyTable};
pub use http::HttpModule;
pub use regex_parser::RegexParser;
pub use search_params::SearchParamsGlobal;
pub use shortener::{Shortener, ShortenerModule};
pub use template::{render, request_from_template, TemplateError};
pub use timers::{TimerThread, TimersGlobal};

use ski_engine::host::FetchError;
use ski_engine::{Cache, Fetch, ModuleRegistry};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building the standard library
#[derive(Debug, Error)]
pub enum StdlibError {
    /// The HTTP client or a proxy could not be configured
    #[error("http client: {0}")]
    Fetch(#[from] FetchError),

    /// The timer thread could not be spawned
    #[error("timer thread: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for stdlib construction
pub type StdlibResult<T> = Result<T, StdlibError>;

/// Standard library settings
#[derive(Debug, Clone, Default)]
pub struct StdlibOptions {
    /// HTTP client settings
    pub fetch: FetchOptions,
    /// Proxy rotations keyed by target host or URL
    pub proxies: Vec<(String, Vec<String>)>,
    /// Expiry for cache writes that pass no TTL
    pub default_ttl: Option<Duration>,
}

/// Backing services shared by every VM of a registry
pub struct Stdlib {
    cache: Arc<MemoryCache>,
    fetch: Arc<dyn Fetch>,
    proxies: Option<Arc<ProxyTable>>,
    timer: Arc<TimerThread>,
    default_ttl: Option<Duration>,
}

impl Stdlib {
    /// Build the services with a real HTTP client
    pub fn new(options: StdlibOptions) -> StdlibResult<Self> {
        let proxies = Arc::new(ProxyTable::new());
        for (target, list) in options.proxies {
            proxies.set(&target, list)?;
        }
        let fetch = HttpFetch::new(options.fetch, proxies.clone())?;
        Ok(Self {
            cache: Arc::new(MemoryCache::new()),
            fetch: Arc::new(fetch),
            proxies: Some(proxies),
            timer: Arc::new(TimerThread::start()?),
            default_ttl: options.default_ttl,
        })
    }

    /// Build the services around a caller-supplied [`Fetch`].
    ///
    /// Scripts cannot configure proxies through such a client.
    pub fn with_fetch(fetch: Arc<dyn Fetch>, default_ttl: Option<Duration>) -> StdlibResult<Self> {
        Ok(Self {
            cache: Arc::new(MemoryCache::new()),
            fetch,
            proxies: None,
            timer: Arc::new(TimerThread::start()?),
            default_ttl,
        })
    }

    /// The cache behind `ski:cache`
    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    /// The client behind `ski:http`, also usable to load remote modules
    pub fn fetch(&self) -> Arc<dyn Fetch> {
        self.fetch.clone()
    }

    /// The timer thread behind `setTimeout` and `sleep`
    pub fn timers(&self) -> &Arc<TimerThread> {
        &self.timer
    }

    /// Register every module, parser and global on `registry`
    pub fn register(&self, registry: &mut ModuleRegistry) {
        let cache: Arc<dyn Cache> = self.cache.clone();
        registry
            .register_module("cache", CacheModule::new(cache.clone(), self.default_ttl))
            .register_module("http", HttpModule::new(self.fetch.clone(), self.proxies.clone()))
            .register_module(
                "shortener",
                ShortenerModule::new(Shortener::new(cache)),
            )
            .register_parser("regex", RegexParser::new())
            .register_global("console", ConsoleGlobal)
            .register_global("timers", TimersGlobal::new(self.timer.clone()))
            .register_global("URLSearchParams", SearchParamsGlobal);
    }
}
