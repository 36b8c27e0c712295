//! State shared between a VM, its interrupt hook and its host bindings
//!
//! Everything here is plain Rust data and safe to touch from any thread.
//! Script values never live here; they stay on the VM (see [`super::slots`]).

use super::slots::Slots;
use super::{VmError, VmResult};
use crate::context::RunContext;
use crate::event_loop::{LoopHandle, Resolver};
use crate::module::ModuleLoader;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// The run currently executing on a VM
struct ActiveRun {
    context: RunContext,
    events: LoopHandle,
}

pub(crate) struct VmShared {
    pub(crate) id: usize,
    pub(crate) strict: bool,
    pub(crate) modules: Arc<ModuleLoader>,
    pub(crate) slots: Slots,
    interrupted: AtomicBool,
    active: Mutex<Option<ActiveRun>>,
    /// ES module entry units evaluated on this VM
    module_runs: AtomicUsize,
}

impl VmShared {
    pub(crate) fn new(id: usize, strict: bool, modules: Arc<ModuleLoader>) -> Self {
        Self {
            id,
            strict,
            modules,
            slots: Slots::new(),
            interrupted: AtomicBool::new(false),
            active: Mutex::new(None),
            module_runs: AtomicUsize::new(0),
        }
    }

    /// Mark `context` and `events` as the active run until the guard drops
    pub(crate) fn activate(&self, context: RunContext, events: LoopHandle) -> ActiveGuard<'_> {
        let previous = self.active.lock().replace(ActiveRun { context, events });
        ActiveGuard {
            shared: self,
            previous,
        }
    }

    pub(crate) fn active_context(&self) -> Option<RunContext> {
        self.active.lock().as_ref().map(|run| run.context.clone())
    }

    fn active_events(&self) -> VmResult<LoopHandle> {
        self.active
            .lock()
            .as_ref()
            .map(|run| run.events.clone())
            .ok_or(VmError::NoActiveRun(self.id))
    }

    pub(crate) fn register_callback(&self, weak: bool) -> VmResult<Resolver> {
        Ok(self.active_events()?.register(weak))
    }

    /// Id of the active run
    pub(crate) fn active_run(&self) -> VmResult<u64> {
        Ok(self.active_events()?.id())
    }

    /// Run `cleanup` once the active run has ended
    pub(crate) fn on_run_end(&self, cleanup: Box<dyn FnOnce() + Send>) -> VmResult<()> {
        self.active_events()?.on_end(cleanup);
        Ok(())
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub(crate) fn reset_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    /// Polled by the engine's interrupt hook
    pub(crate) fn should_interrupt(&self) -> bool {
        self.stop_reason().is_some()
    }

    /// Why the active run must stop, if it must
    pub(crate) fn stop_reason(&self) -> Option<VmError> {
        let context_error = self
            .active
            .lock()
            .as_ref()
            .and_then(|run| run.context.err());
        context_error.or_else(|| {
            self.interrupted
                .load(Ordering::Acquire)
                .then_some(VmError::Cancelled)
        })
    }

    /// Count an ES module entry evaluation; returns the new total
    pub(crate) fn count_module_run(&self) -> usize {
        self.module_runs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn module_runs(&self) -> usize {
        self.module_runs.load(Ordering::Relaxed)
    }
}

pub(crate) struct ActiveGuard<'a> {
    shared: &'a VmShared,
    previous: Option<ActiveRun>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.shared.active.lock() = self.previous.take();
    }
}
