//! Ski Script Engine
//!
//! This crate provides the embedded script-execution core used by Ski:
//! - **VM**: one isolated script interpreter with host bindings (`vm` module)
//! - **Event loop**: the callback-registration protocol that funnels async
//!   results back into a VM (`event_loop` module)
//! - **Module loader**: CommonJS/ES module resolution with caching and
//!   cycle handling (`module` module)
//! - **Scheduler**: a bounded pool of VMs handed out as exclusive leases
//!   (`scheduler` module)
//! - **Host contracts**: the Parser, Cache and Fetch boundaries (`host` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use ski_engine::{ModuleLoader, RunContext, Scheduler, SchedulerOptions};
//! use std::time::Duration;
//!
//! let loader = Arc::new(ModuleLoader::with_registry(registry)?);
//! let scheduler = Scheduler::new(SchedulerOptions::default(), loader)?;
//!
//! let ctx = RunContext::background().with_timeout(Duration::from_secs(5));
//! let value = scheduler.run_string(&ctx, "1 + 2")?;
//! assert_eq!(value, serde_json::json!(3));
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::type_complexity)]

/// Run-scoped context: deadline, cancellation and caller data
pub mod context;

/// Event loop: callback registration and serialized delivery into a VM
pub mod event_loop;

/// Host contracts consumed by script bindings
pub mod host;

/// Module loader: specifier resolution, compilation and caching
pub mod module;

/// VM pool
pub mod scheduler;

/// Script VM
pub mod vm;

pub use context::RunContext;
pub use event_loop::{EventLoop, Payload, Resolver};
pub use host::{Cache, Fetch, HostContext, HostGlobal, HostModule, Parser, Slot};
pub use module::{
    DefaultSourceReader, LoaderOptions, ModuleError, ModuleKind, ModuleLoader, ModuleRecord,
    ModuleRef, ModuleRegistry, SourceReader,
};
pub use scheduler::{Scheduler, SchedulerOptions, SchedulerStats, VmLease};
pub use vm::{
    describe, from_json, to_json, CompiledUnit, InterruptHandle, Vm, VmError, VmOptions, VmResult,
    DEFAULT_MAX_MODULE_RUNS,
};

/// Prefix of the native host-module namespace (`ski:cache`, `ski:http`, ...)
pub const NATIVE_PREFIX: &str = "ski:";

/// Prefix of the parser executor namespace (`parser:regex`, ...)
pub const PARSER_PREFIX: &str = "parser:";
