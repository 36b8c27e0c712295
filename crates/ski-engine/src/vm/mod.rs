//! Script VM
//!
//! A `Vm` owns one engine runtime and context. It is created once, reused
//! across many runs and never shared by two runs at once: every run goes
//! through `&mut Vm`, and the scheduler hands VMs out as exclusive leases.
//!
//! Per-VM setup happens in [`Vm::new`]:
//! - interrupt hook polling the active run's context and the interrupt flag
//! - module resolver/loader hooks backed by the shared `ModuleLoader`
//! - promise-rejection tracker feeding "uncaught (in promise)" errors
//! - the global `require` and every global host binding
//!
//! Scripts run inside a block, so top-level `let`/`const` bindings of one
//! run never collide with the next run on the same VM. Every ES module
//! entry run declares a module the engine keeps until the VM is dropped;
//! after [`VmOptions::max_module_runs`] of them the VM reports itself worn
//! and the scheduler replaces it.

pub(crate) mod bindings;
pub(crate) mod convert;
pub(crate) mod error;
mod modules;
pub(crate) mod shared;
pub(crate) mod slots;

pub use convert::{from_json, to_json};
pub use error::{describe, VmError, VmResult};

use crate::context::RunContext;
use crate::event_loop::{bridge, EventLoop, Outcome};
use crate::host::HostContext;
use crate::module::{syntax, ModuleLoader};
use modules::ModuleHooks;
use rquickjs::function::Rest;
use rquickjs::{Context, Ctx, Module, Runtime, Value};
use shared::VmShared;
use slots::Slots;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Default number of ES module entry runs before a VM is replaced
pub const DEFAULT_MAX_MODULE_RUNS: usize = 256;

/// Per-VM engine settings
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    /// Evaluate scripts in strict mode
    pub strict: bool,
    /// Engine heap limit in bytes
    pub memory_limit: Option<usize>,
    /// Engine stack limit in bytes
    pub max_stack_size: Option<usize>,
    /// ES module entry runs after which the VM is worn
    /// (0 = [`DEFAULT_MAX_MODULE_RUNS`])
    pub max_module_runs: usize,
}

/// Kind of a compiled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Classic script; the completion value is the result
    Script,
    /// ES module; evaluation yields a promise
    Module,
}

/// Source that passed a syntax check, ready to run on any VM
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    name: Arc<str>,
    source: Arc<str>,
    kind: UnitKind,
}

impl CompiledUnit {
    /// Name used for stack traces and relative imports
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit kind
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Source text
    pub fn source(&self) -> &str {
        &self.source
    }

    fn evaluate<'js>(&self, ctx: &Ctx<'js>, shared: &VmShared) -> rquickjs::Result<Value<'js>> {
        match self.kind {
            UnitKind::Script => bindings::eval_script(
                ctx,
                &self.name,
                &bindings::scoped(&self.source),
                shared.strict,
            ),
            UnitKind::Module => {
                shared.count_module_run();
                Module::evaluate(ctx.clone(), &*self.name, &*self.source)
                    .map(|promise| promise.into_value())
            }
        }
    }
}

/// Cross-thread handle that interrupts whatever runs on its VM
#[derive(Clone)]
pub struct InterruptHandle {
    shared: Arc<VmShared>,
}

impl InterruptHandle {
    /// Abort the current run at its next checked point
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

/// One isolated script-execution environment
pub struct Vm {
    shared: Arc<VmShared>,
    max_module_runs: usize,
    // Field order matters: the context must drop before the runtime.
    context: Context,
    runtime: Runtime,
}

impl Vm {
    /// Create a VM and install its host bindings
    pub fn new(id: usize, options: &VmOptions, modules: Arc<ModuleLoader>) -> VmResult<Self> {
        let runtime = Runtime::new().map_err(|err| VmError::Engine(err.to_string()))?;
        if let Some(limit) = options.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = options.max_stack_size {
            runtime.set_max_stack_size(size);
        }

        let shared = Arc::new(VmShared::new(id, options.strict, modules));

        let watcher = shared.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || watcher.should_interrupt())));

        runtime.set_host_promise_rejection_tracker(Some(Box::new(
            |ctx, promise, reason, handled| {
                if let Err(err) = Slots::track_rejection(&ctx, promise, reason, handled) {
                    debug!(error = %err, "rejection not tracked");
                }
            },
        )));

        runtime.set_loader(
            ModuleHooks::new(shared.clone()),
            ModuleHooks::new(shared.clone()),
        );

        let context = Context::full(&runtime).map_err(|err| VmError::Engine(err.to_string()))?;
        context.with(|ctx| {
            bindings::install(&ctx, &shared).map_err(|err| VmError::from_js(&ctx, err))
        })?;

        debug!(vm = id, strict = options.strict, "vm created");
        let max_module_runs = match options.max_module_runs {
            0 => DEFAULT_MAX_MODULE_RUNS,
            limit => limit,
        };
        Ok(Self {
            shared,
            max_module_runs,
            context,
            runtime,
        })
    }

    /// VM id, unique within its scheduler
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// The module loader this VM resolves through
    pub fn modules(&self) -> &Arc<ModuleLoader> {
        &self.shared.modules
    }

    /// Host handle for this VM, as given to host bindings
    pub fn host(&self) -> HostContext {
        HostContext::new(self.shared.clone())
    }

    /// Compile a classic script without running it
    pub fn compile(&self, name: &str, source: &str) -> VmResult<CompiledUnit> {
        self.shared
            .modules
            .compiler()
            .check_script(name, source, self.shared.strict)?;
        Ok(CompiledUnit {
            name: name.into(),
            source: source.into(),
            kind: UnitKind::Script,
        })
    }

    /// Whether the VM has run enough ES module entries that it should be
    /// replaced rather than reused
    pub fn is_worn(&self) -> bool {
        self.shared.module_runs() >= self.max_module_runs
    }

    /// Compile an ES module without running it
    pub fn compile_module(&self, name: &str, source: &str) -> VmResult<CompiledUnit> {
        self.shared.modules.compiler().check_module(name, source)?;
        Ok(CompiledUnit {
            name: name.into(),
            source: source.into(),
            kind: UnitKind::Module,
        })
    }

    /// Compile as a module when the source uses module syntax, else as a script
    pub fn compile_auto(&self, name: &str, source: &str) -> VmResult<CompiledUnit> {
        if syntax::is_es_module(source) {
            self.compile_module(name, source)
        } else {
            self.compile(name, source)
        }
    }

    /// Run a compiled unit to completion under `context`.
    ///
    /// The completion value is returned as JSON; a promise is awaited
    /// through the event loop and its settled value returned.
    pub fn run(
        &mut self,
        unit: &CompiledUnit,
        context: &RunContext,
    ) -> VmResult<serde_json::Value> {
        let shared = self.shared.clone();
        self.run_entry(context, move |ctx| {
            unit.evaluate(&ctx, &shared)
                .map_err(|err| VmError::from_js(&ctx, err))
        })
    }

    /// Compile and run a script
    pub fn run_string(
        &mut self,
        context: &RunContext,
        source: &str,
    ) -> VmResult<serde_json::Value> {
        let unit = self.compile("<eval>", source)?;
        self.run(&unit, context)
    }

    /// Require `specifier` (from the configured base) and call its default
    /// export with `args`; a non-function export is returned as is.
    pub fn run_module(
        &mut self,
        context: &RunContext,
        specifier: &str,
        args: &[serde_json::Value],
    ) -> VmResult<serde_json::Value> {
        let shared = self.shared.clone();
        self.run_entry(context, move |ctx| {
            call_default_export(&ctx, &shared, specifier, args)
                .map_err(|err| VmError::from_js(&ctx, err))
        })
    }

    fn run_entry<F>(&mut self, context: &RunContext, entry: F) -> VmResult<serde_json::Value>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> VmResult<Value<'js>> + Send,
    {
        let outcome = Outcome::default();
        let events = EventLoop::new(self, context.clone());
        let started = events.start(|ctx| {
            let value = entry(ctx.clone())?;
            bridge(&ctx, &events, value, outcome.clone())
        });
        let drained = events.wait_on_registered();
        drop(events);
        self.context.with(|ctx| {
            if let Err(err) = Slots::clear_values(&ctx) {
                debug!(vm = self.shared.id, error = %err, "kept values not cleared");
            }
        });
        started?;
        drained?;
        let settled = outcome.lock().take();
        settled.unwrap_or(Err(VmError::PendingPromise))
    }

    /// Abort the current run at its next checked point
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    /// Handle for interrupting this VM from another thread
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run `f` with direct access to the engine context
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + Send,
        R: Send,
    {
        self.context.with(f)
    }

    pub(crate) fn shared(&self) -> &VmShared {
        &self.shared
    }

    /// Execute `f` on the VM, then drain engine jobs and surface the first
    /// unhandled rejection. Errors are reclassified as context errors when
    /// the active run must stop.
    pub(crate) fn enter<F, R>(&self, f: F) -> VmResult<R>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> VmResult<R> + Send,
        R: Send,
    {
        let result = self.context.with(f);
        let jobs = self.run_jobs();
        let rejection = self
            .context
            .with(|ctx| Slots::take_rejection(&ctx).ok().flatten());

        let result = result.and_then(|value| {
            jobs?;
            match rejection {
                Some(reason) => Err(VmError::UncaughtRejection(reason)),
                None => Ok(value),
            }
        });
        result.map_err(|err| self.classify(err))
    }

    fn run_jobs(&self) -> VmResult<()> {
        let mut first = None;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(job) => {
                    let err = job
                        .0
                        .with(|ctx| VmError::from_js(&ctx, rquickjs::Error::Exception));
                    first.get_or_insert(err);
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn classify(&self, err: VmError) -> VmError {
        if err.is_context_error() {
            return err;
        }
        self.shared.stop_reason().unwrap_or(err)
    }
}

fn call_default_export<'js>(
    ctx: &Ctx<'js>,
    shared: &Arc<VmShared>,
    specifier: &str,
    args: &[serde_json::Value],
) -> rquickjs::Result<Value<'js>> {
    let exports = bindings::require(ctx, shared, None, specifier)?;
    let Some(function) = exports.as_function() else {
        return Ok(exports);
    };
    let args = args
        .iter()
        .map(|arg| convert::from_json(ctx, arg))
        .collect::<rquickjs::Result<Vec<_>>>()?;
    function.call((Rest(args),))
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.shared.id)
            .field("strict", &self.shared.strict)
            .field("module_runs", &self.shared.module_runs())
            .finish()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        debug!(vm = self.shared.id, "vm destroyed");
    }
}
