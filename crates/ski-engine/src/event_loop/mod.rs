//! Per-run event loop
//!
//! An `EventLoop` wraps one run on one VM. Script code (through host
//! bindings) registers pending async work with `register_callback`, which
//! hands back a one-shot [`Resolver`]. Whoever completes the work calls
//! `resolve` from any thread with a payload; the loop executes payloads on
//! the VM one at a time, in completion order, from the thread that called
//! `start`/`wait_on_registered`.
//!
//! Once the run context expires (or the VM is interrupted) the loop is
//! aborted: payloads delivered later are dropped unrun, `start` returns the
//! context error at once and `wait_on_registered` still blocks until every
//! resolver has been delivered. Cleanups registered for the run execute
//! when the loop aborts or is dropped, whichever comes first.
//!
//! ```text
//!   Idle ── start ──► Running ──► Draining ──► Completed | Failed
//!                         │                          ▲
//!                         └── entry error ───────────┘  (wait_on_registered drains)
//! ```

mod promise;

pub(crate) use promise::{bridge, Outcome};

use crate::context::RunContext;
use crate::vm::{Vm, VmError, VmResult};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rquickjs::Ctx;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Work delivered into the VM by a resolver
pub type Payload = Box<dyn for<'js> FnOnce(Ctx<'js>) -> VmResult<()> + Send>;

/// Upper bound on how long the drain loop sleeps before re-checking the
/// run context for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Source of run ids, unique within the process
static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

type Cleanup = Box<dyn FnOnce() + Send>;

/// How far a drain goes once the run context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    /// Return the context error at once
    UntilAborted,
    /// Keep consuming deliveries, unrun, until none is pending
    UntilEmpty,
}

struct Delivery {
    payload: Payload,
    weak: bool,
}

pub(crate) struct LoopShared {
    id: u64,
    sender: Sender<Delivery>,
    receiver: Receiver<Delivery>,
    /// Registered resolvers whose delivery has not been consumed yet
    pending: AtomicUsize,
    /// The subset of `pending` that does not keep the run open on its own
    weak: AtomicUsize,
    /// Set once the run context expired; late payloads are dropped
    aborted: AtomicBool,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl LoopShared {
    fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            id: NEXT_RUN.fetch_add(1, Ordering::Relaxed),
            sender,
            receiver,
            pending: AtomicUsize::new(0),
            weak: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    fn strong_pending(&self) -> usize {
        self.pending
            .load(Ordering::Acquire)
            .saturating_sub(self.weak.load(Ordering::Acquire))
    }

    fn consumed(&self, delivery: &Delivery) {
        if delivery.weak {
            self.weak.fetch_sub(1, Ordering::AcqRel);
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle stored on the VM while a run is active, so host bindings can
/// register callbacks with the right loop.
#[derive(Clone)]
pub(crate) struct LoopHandle(Arc<LoopShared>);

impl LoopHandle {
    /// Id of the run this loop serves
    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    /// Run `cleanup` when the loop is dropped
    pub(crate) fn on_end(&self, cleanup: Cleanup) {
        self.0.cleanups.lock().push(cleanup);
    }

    pub(crate) fn register(&self, weak: bool) -> Resolver {
        if weak {
            self.0.weak.fetch_add(1, Ordering::AcqRel);
        }
        self.0.pending.fetch_add(1, Ordering::AcqRel);
        Resolver {
            sender: self.0.sender.clone(),
            fired: AtomicBool::new(false),
            weak,
        }
    }
}

/// One-shot handle delivering the outcome of async work into its VM
///
/// Resolving twice is a caller bug and panics. A resolver dropped without
/// being resolved counts as resolved with an empty payload.
pub struct Resolver {
    sender: Sender<Delivery>,
    fired: AtomicBool,
    weak: bool,
}

impl Resolver {
    /// Deliver `payload` to run on the owning VM.
    ///
    /// # Panics
    ///
    /// Panics if this resolver was already resolved.
    pub fn resolve<F>(&self, payload: F)
    where
        F: for<'js> FnOnce(Ctx<'js>) -> VmResult<()> + Send + 'static,
    {
        if self.fired.swap(true, Ordering::AcqRel) {
            panic!("event loop resolver resolved twice");
        }
        self.deliver(Box::new(payload));
    }

    fn deliver(&self, payload: Payload) {
        let delivery = Delivery {
            payload,
            weak: self.weak,
        };
        if self.sender.send(delivery).is_err() {
            debug!("event loop finished before resolver fired; payload dropped");
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            if !self.weak {
                warn!("event loop resolver dropped without being resolved");
            }
            self.deliver(Box::new(|_| Ok(())));
        }
    }
}

/// Event loop wrapping one run of a VM
pub struct EventLoop<'vm> {
    vm: &'vm Vm,
    context: RunContext,
    handle: LoopHandle,
}

impl<'vm> EventLoop<'vm> {
    /// Create a loop for a run on `vm` under `context`.
    ///
    /// Borrowing the VM mutably keeps any other run off it until the loop
    /// is dropped.
    pub fn new(vm: &'vm mut Vm, context: RunContext) -> Self {
        Self {
            vm,
            context,
            handle: LoopHandle(Arc::new(LoopShared::new())),
        }
    }

    /// The run context
    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Register pending async work, returning its resolver.
    ///
    /// Call only while code runs on the owning VM: inside `entry` or inside
    /// another resolver's payload.
    pub fn register_callback(&self) -> Resolver {
        self.handle.register(false)
    }

    /// Register a callback that does not keep the run open by itself
    pub(crate) fn register_weak(&self) -> Resolver {
        self.handle.register(true)
    }

    /// Resolvers registered and not yet delivered
    pub fn pending(&self) -> usize {
        self.handle.0.pending.load(Ordering::Acquire)
    }

    /// Run `entry` on the VM, then drain registered work.
    ///
    /// An error from `entry` is returned at once; work it registered keeps
    /// going and is drained by [`EventLoop::wait_on_registered`]. Otherwise
    /// this returns after every pending payload ran, with the first payload
    /// error if there was one. An expired run context ends the drain at
    /// once with the context error.
    pub fn start<F, R>(&self, entry: F) -> VmResult<R>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> VmResult<R> + Send,
        R: Send,
    {
        let _active = self
            .vm
            .shared()
            .activate(self.context.clone(), self.handle.clone());
        self.vm.shared().reset_interrupt();

        let value = self.vm.enter(entry).map_err(|err| self.failed(err))?;
        self.drain(Drain::UntilAborted)?;
        Ok(value)
    }

    /// Block until every registered resolver has been delivered.
    ///
    /// Returns the first error raised while draining. Once the run context
    /// expired this still waits for outstanding resolvers, but their
    /// payloads are dropped unrun and the context error is returned.
    pub fn wait_on_registered(&self) -> VmResult<()> {
        let _active = self
            .vm
            .shared()
            .activate(self.context.clone(), self.handle.clone());
        self.drain(Drain::UntilEmpty)
    }

    fn drain(&self, mode: Drain) -> VmResult<()> {
        let shared = &self.handle.0;
        let mut first: Option<VmError> = None;

        while shared.strong_pending() > 0 {
            if shared.aborted.load(Ordering::Acquire) {
                if mode == Drain::UntilAborted {
                    break;
                }
                match shared.receiver.recv() {
                    Ok(delivery) => shared.consumed(&delivery),
                    Err(_) => break,
                }
                continue;
            }

            let wait = match self.context.remaining() {
                Some(left) if !left.is_zero() => left.min(POLL_INTERVAL),
                _ => POLL_INTERVAL,
            };

            match shared.receiver.recv_timeout(wait) {
                Ok(delivery) => {
                    shared.consumed(&delivery);
                    if let Err(err) = self.vm.enter(delivery.payload) {
                        first.get_or_insert(self.failed(err));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(err) = self.vm.shared().stop_reason() {
                        self.abort();
                        first.get_or_insert(err);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if first.is_none() && shared.aborted.load(Ordering::Acquire) {
            first = Some(
                self.vm
                    .shared()
                    .stop_reason()
                    .unwrap_or(VmError::Cancelled),
            );
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn failed(&self, err: VmError) -> VmError {
        if err.is_context_error() {
            self.abort();
        }
        err
    }

    /// Stop running payloads and release the run's cleanups, so work
    /// such as timers settles now instead of when it would have fired
    fn abort(&self) {
        if self.handle.0.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            vm = self.vm.id(),
            pending = self.pending(),
            "run context done; dropping late payloads"
        );
        self.run_cleanups();
    }

    fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.handle.0.cleanups.lock());
        for cleanup in cleanups {
            cleanup();
        }
    }
}

impl Drop for EventLoop<'_> {
    fn drop(&mut self) {
        self.run_cleanups();
    }
}
