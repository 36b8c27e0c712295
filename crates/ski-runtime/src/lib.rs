//! Ski Runtime
//!
//! Binds the Ski engine with the standard library: reads [`Config`],
//! assembles the module registry, and exposes a [`Runtime`] that runs
//! scripts, files and modules on a pool of VMs.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{RuntimeError, RuntimeResult};

use ski_engine::{
    DefaultSourceReader, ModuleLoader, ModuleRegistry, RunContext, Scheduler, SchedulerStats,
};
use ski_stdlib::Stdlib;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Scheduler plus the host services its VMs share
pub struct Runtime {
    config: Config,
    stdlib: Stdlib,
    scheduler: Scheduler,
}

impl Runtime {
    /// Build a runtime with the standard library
    pub fn new(config: Config) -> RuntimeResult<Self> {
        Self::with_modules(config, |_| {})
    }

    /// Build a runtime, letting `extend` add host modules after the
    /// standard library has registered its own
    pub fn with_modules<F>(config: Config, extend: F) -> RuntimeResult<Self>
    where
        F: FnOnce(&mut ModuleRegistry),
    {
        let stdlib = Stdlib::new(config.stdlib_options())?;
        let mut registry = ModuleRegistry::new();
        stdlib.register(&mut registry);
        extend(&mut registry);

        let reader = DefaultSourceReader::new(Some(stdlib.fetch()));
        let loader = ModuleLoader::new(config.loader_options()?, Arc::new(reader), registry)?;
        let scheduler = Scheduler::new(config.scheduler_options(), Arc::new(loader))?;
        debug!(modules = ?scheduler.modules().registry().module_names(), "runtime ready");

        Ok(Self {
            config,
            stdlib,
            scheduler,
        })
    }

    /// Configuration the runtime was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Host services shared by every VM
    pub fn stdlib(&self) -> &Stdlib {
        &self.stdlib
    }

    /// The VM pool
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Pool statistics
    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Run a script string
    pub fn run_string(&self, ctx: &RunContext, source: &str) -> RuntimeResult<serde_json::Value> {
        Ok(self.scheduler.run_string(ctx, source)?)
    }

    /// Run a file.
    ///
    /// `.mjs` files and files using module syntax run as ES modules,
    /// anything else as a script; relative imports resolve from the
    /// file's directory.
    pub fn run_file(&self, ctx: &RunContext, path: &Path) -> RuntimeResult<serde_json::Value> {
        let source = fs::read_to_string(path)?;
        let name = file_url(path)?;
        let as_module = path.extension().is_some_and(|ext| ext == "mjs");
        debug!(file = %name, as_module, "running file");

        Ok(self.scheduler.run(ctx, |vm| {
            let unit = if as_module {
                vm.compile_module(&name, &source)?
            } else {
                vm.compile_auto(&name, &source)?
            };
            vm.run(&unit, ctx)
        })?)
    }

    /// Load a file as a module and call its default export with `args`
    pub fn run_file_export(
        &self,
        ctx: &RunContext,
        path: &Path,
        args: &[serde_json::Value],
    ) -> RuntimeResult<serde_json::Value> {
        let name = file_url(path)?;
        self.run_module(ctx, &name, args)
    }

    /// Require `specifier` from the configured base and call its default
    /// export with `args`
    pub fn run_module(
        &self,
        ctx: &RunContext,
        specifier: &str,
        args: &[serde_json::Value],
    ) -> RuntimeResult<serde_json::Value> {
        Ok(self.scheduler.run_module(ctx, specifier, args)?)
    }
}

/// `file://` URL of `path`, made absolute against the working directory
fn file_url(path: &Path) -> RuntimeResult<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&absolute)
        .map(String::from)
        .map_err(|()| RuntimeError::InvalidConfig(format!("not a file path: {}", path.display())))
}
