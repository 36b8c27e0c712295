//! Host contracts
//!
//! Everything a script can reach outside the engine goes through one of
//! these seams:
//! - [`HostModule`]: a native module reached as `require("ski:<name>")`
//! - [`HostGlobal`]: bindings installed on the global object of every VM
//! - [`Parser`], [`Cache`], [`Fetch`]: the external collaborators those
//!   bindings wrap
//!
//! Bindings are installed once per VM. They never capture run state; they
//! read it through the [`HostContext`] handed to them, which always points
//! at the run currently active on that VM.
//!
//! Script values that a binding needs after it returns are kept on the VM
//! with [`HostContext::keep`]; only the returned [`Slot`] crosses threads.

mod cache;
mod fetch;
mod io;
mod parser;

pub use cache::Cache;
pub use fetch::{Fetch, FetchError, Request, Response};
pub use parser::{Parser, ParserError};

pub use crate::vm::slots::Slot;

pub(crate) use parser::parser_exports;

use crate::context::RunContext;
use crate::event_loop::Resolver;
use crate::vm::shared::VmShared;
use crate::vm::{VmError, VmResult};
use io::IoPool;
use rquickjs::{Ctx, Exception, Function, Object, Promise, Value};
use std::sync::Arc;

/// A native module exposed under the `ski:` namespace
pub trait HostModule: Send + Sync {
    /// Build the module's exports on `ctx`.
    ///
    /// Called at most once per VM; the result is cached for later requires.
    fn instantiate<'js>(&self, ctx: &Ctx<'js>, host: &HostContext)
        -> rquickjs::Result<Value<'js>>;
}

/// Bindings installed on the global object of every VM
pub trait HostGlobal: Send + Sync {
    /// Define the bindings on `globals`
    fn install<'js>(
        &self,
        ctx: &Ctx<'js>,
        globals: &Object<'js>,
        host: &HostContext,
    ) -> rquickjs::Result<()>;
}

/// Handle through which host bindings reach the run active on their VM
#[derive(Clone)]
pub struct HostContext {
    shared: Arc<VmShared>,
}

impl HostContext {
    pub(crate) fn new(shared: Arc<VmShared>) -> Self {
        Self { shared }
    }

    /// Id of the VM these bindings are installed on
    pub fn vm_id(&self) -> usize {
        self.shared.id
    }

    /// Context of the active run, or a background context between runs
    pub fn run_context(&self) -> RunContext {
        self.shared.active_context().unwrap_or_default()
    }

    /// Register pending async work with the active run's event loop
    pub fn register_callback(&self) -> VmResult<Resolver> {
        self.shared.register_callback(false)
    }

    /// Id of the active run, unique within the process
    pub fn run_id(&self) -> VmResult<u64> {
        self.shared.active_run()
    }

    /// Call `cleanup` once the active run has ended, however it ended
    pub fn on_run_end<F>(&self, cleanup: F) -> VmResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.on_run_end(Box::new(cleanup))
    }

    /// Keep `value` on this VM until the slot is taken or the active run
    /// ends
    pub fn keep<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Slot> {
        self.shared.slots.keep(ctx, value)
    }

    /// Run `work` on an IO worker thread and settle a script promise with
    /// its outcome.
    ///
    /// `settle` converts the successful output into a script value on the
    /// VM thread; an `Err` rejects the promise with an `Error` carrying the
    /// message.
    pub fn spawn_promise<'js, T, W, S>(
        &self,
        ctx: &Ctx<'js>,
        work: W,
        settle: S,
    ) -> rquickjs::Result<Promise<'js>>
    where
        T: Send + 'static,
        W: FnOnce(&RunContext) -> Result<T, String> + Send + 'static,
        S: for<'a> FnOnce(&Ctx<'a>, T) -> rquickjs::Result<Value<'a>> + Send + 'static,
    {
        let pool = IoPool::shared().map_err(|err| VmError::Engine(err.to_string()).throw(ctx))?;
        let resolver = self.register_callback().map_err(|err| err.throw(ctx))?;
        let (promise, resolve, reject) = Promise::new(ctx)?;
        let resolve = self.keep(ctx, resolve.into_value())?;
        let reject = self.keep(ctx, reject.into_value())?;
        let run = self.run_context();

        pool.submit(Box::new(move || {
            let outcome = work(&run);
            resolver.resolve(move |ctx| {
                let settled = (|| -> rquickjs::Result<()> {
                    let resolve: Function<'_> = resolve.take(&ctx)?.get()?;
                    let reject: Function<'_> = reject.take(&ctx)?.get()?;
                    match outcome {
                        Ok(output) => {
                            let value = settle(&ctx, output)?;
                            resolve.call::<_, ()>((value,))
                        }
                        Err(message) => {
                            let error = Exception::from_message(ctx.clone(), &message)?;
                            reject.call::<_, ()>((error,))
                        }
                    }
                })();
                settled.map_err(|err| VmError::from_js(&ctx, err))
            });
        }));

        Ok(promise)
    }
}
