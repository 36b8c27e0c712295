//! Runtime configuration (ski.toml)
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Zero values mean "use the default".
//!
//! ```toml
//! [js]
//! max_vms = 8
//! max_wait_ms = 1000
//! base = "scripts"
//!
//! [fetch]
//! timeout_ms = 10000
//! proxies = { "api.example.com" = ["http://proxy-a:8080", "http://proxy-b:8080"] }
//!
//! [cache]
//! default_ttl_ms = 60000
//!
//! [log]
//! level = "debug"
//! ```

use crate::error::RuntimeResult;
use serde::Deserialize;
use ski_engine::{LoaderOptions, SchedulerOptions, VmError, VmOptions};
use ski_stdlib::{FetchOptions, StdlibOptions};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const CONFIG_FILE: &str = "ski.toml";

/// Parsed `ski.toml`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Script engine and VM pool
    pub js: JsConfig,
    /// HTTP client
    pub fetch: FetchConfig,
    /// `ski:cache`
    pub cache: CacheConfig,
    /// Log output
    pub log: LogConfig,
}

/// `[js]` table
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct JsConfig {
    /// VMs created at startup (default 2)
    pub initial_vms: usize,
    /// Upper bound on live VMs (default: number of CPUs)
    pub max_vms: usize,
    /// Waits before a saturated acquisition gives up (default 3)
    pub max_retries: u32,
    /// Total wait of a saturated acquisition in milliseconds (default 500)
    pub max_wait_ms: u64,
    /// Run scripts in strict mode
    pub strict: bool,
    /// Directory for relative and bare module resolution (default: working directory)
    pub base: Option<PathBuf>,
    /// Engine heap limit in bytes
    pub memory_limit: usize,
    /// Engine stack limit in bytes
    pub max_stack_size: usize,
    /// ES module entry runs before a VM is replaced (default 256)
    pub max_module_runs: usize,
}

/// `[fetch]` table
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Whole-request timeout in milliseconds (default 30000)
    pub timeout_ms: u64,
    /// `User-Agent` header
    pub user_agent: Option<String>,
    /// Proxy rotations keyed by host
    pub proxies: BTreeMap<String, Vec<String>>,
}

/// `[cache]` table
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Expiry of writes that pass no TTL, in milliseconds (0 = never)
    pub default_ttl_ms: u64,
}

/// `[log]` table
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing` filter directive
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn non_zero(value: usize) -> Option<usize> {
    (value > 0).then_some(value)
}

impl Config {
    /// Parse configuration text
    pub fn parse(text: &str) -> RuntimeResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read a configuration file. A relative `js.base` is taken relative
    /// to the file's directory.
    pub fn load(path: &Path) -> RuntimeResult<Self> {
        let mut config = Self::parse(&fs::read_to_string(path)?)?;
        if let (Some(base), Some(dir)) = (&config.js.base, path.parent()) {
            if base.is_relative() {
                config.js.base = Some(dir.join(base));
            }
        }
        Ok(config)
    }

    /// Load `ski.toml` from `dir` if present, else the defaults
    pub fn discover(dir: &Path) -> RuntimeResult<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// VM options
    pub fn vm_options(&self) -> VmOptions {
        VmOptions {
            strict: self.js.strict,
            memory_limit: non_zero(self.js.memory_limit),
            max_stack_size: non_zero(self.js.max_stack_size),
            max_module_runs: self.js.max_module_runs,
        }
    }

    /// Pool options; zeros fall back to the scheduler defaults
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            initial_vms: self.js.initial_vms,
            max_vms: self.js.max_vms,
            max_retries: self.js.max_retries,
            max_wait: Duration::from_millis(self.js.max_wait_ms),
            vm: self.vm_options(),
        }
    }

    /// Module resolution options
    pub fn loader_options(&self) -> RuntimeResult<LoaderOptions> {
        let dir = self.js.base.as_deref().unwrap_or_else(|| Path::new("."));
        Ok(LoaderOptions::with_dir(dir).map_err(VmError::from)?)
    }

    /// Standard library options
    pub fn stdlib_options(&self) -> StdlibOptions {
        let mut fetch = FetchOptions::default();
        if self.fetch.timeout_ms > 0 {
            fetch.timeout = Duration::from_millis(self.fetch.timeout_ms);
        }
        if let Some(agent) = self.fetch.user_agent.as_ref().filter(|agent| !agent.is_empty()) {
            fetch.user_agent = agent.clone();
        }
        StdlibOptions {
            fetch,
            proxies: self
                .fetch
                .proxies
                .iter()
                .map(|(host, list)| (host.clone(), list.clone()))
                .collect(),
            default_ttl: (self.cache.default_ttl_ms > 0)
                .then(|| Duration::from_millis(self.cache.default_ttl_ms)),
        }
    }
}
