//! VM pool
//!
//! Hands out VMs as exclusive leases. A VM is taken from the idle set, or
//! created while the pool is below its maximum size; otherwise the caller
//! waits on a condition variable with exponential backoff. Both the number
//! of waits and their total duration are bounded, and running out of either
//! is [`VmError::PoolExhausted`], never a silent hang.
//!
//! The only way back into the pool is dropping the [`VmLease`]. A VM that
//! reports itself worn is destroyed on return instead, freeing its slot
//! for a fresh one.

use crate::context::RunContext;
use crate::module::ModuleLoader;
use crate::vm::{Vm, VmError, VmOptions, VmResult};
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default number of VMs created up front
pub const DEFAULT_INITIAL_VMS: usize = 2;

/// Default number of acquisition retries
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default total acquisition wait
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(500);

/// Pool configuration. Zero values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// VMs created when the scheduler starts
    pub initial_vms: usize,
    /// Upper bound on live VMs (defaults to the number of CPUs)
    pub max_vms: usize,
    /// How many times a saturated acquisition waits before giving up
    pub max_retries: u32,
    /// Total time a saturated acquisition may wait
    pub max_wait: Duration,
    /// Options for every VM the pool creates
    pub vm: VmOptions,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            initial_vms: DEFAULT_INITIAL_VMS,
            max_vms: num_cpus::get(),
            max_retries: DEFAULT_MAX_RETRIES,
            max_wait: DEFAULT_MAX_WAIT,
            vm: VmOptions::default(),
        }
    }
}

impl SchedulerOptions {
    fn normalized(mut self) -> Self {
        if self.max_vms == 0 {
            self.max_vms = num_cpus::get().max(1);
        }
        if self.initial_vms == 0 {
            self.initial_vms = DEFAULT_INITIAL_VMS;
        }
        self.initial_vms = self.initial_vms.min(self.max_vms);
        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
        if self.max_wait.is_zero() {
            self.max_wait = DEFAULT_MAX_WAIT;
        }
        self
    }

    /// Wait before retry `attempt` (0-based). Waits double each retry and
    /// add up to `max_wait` over `max_retries` retries.
    fn backoff(&self, attempt: u32) -> Duration {
        let retries = self.max_retries.clamp(1, 31);
        let attempt = attempt.min(retries - 1);
        let total = (1u64 << retries) - 1;
        let nanos = self.max_wait.as_nanos() * (1u128 << attempt) / total as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// VMs alive (idle plus leased)
    pub created: usize,
    /// VMs waiting in the idle set
    pub idle: usize,
    /// VMs currently leased
    pub in_use: usize,
    /// Maximum pool size
    pub max_vms: usize,
    /// Successful acquisitions
    pub acquired: u64,
    /// Acquisitions that ended in `PoolExhausted`
    pub exhausted: u64,
}

struct PoolState {
    idle: Vec<Vm>,
    /// Live VMs plus slots reserved by in-flight creations
    created: usize,
    in_use: usize,
}

struct Pool {
    options: SchedulerOptions,
    modules: Arc<ModuleLoader>,
    state: Mutex<PoolState>,
    available: Condvar,
    next_id: AtomicUsize,
    acquired: AtomicU64,
    exhausted: AtomicU64,
}

impl Pool {
    fn create_vm(&self) -> VmResult<Vm> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Vm::new(id, &self.options.vm, self.modules.clone())
    }

    fn release(&self, vm: Vm) {
        let mut state = self.state.lock();
        state.in_use -= 1;
        if vm.is_worn() {
            state.created -= 1;
            drop(state);
            debug!(vm = vm.id(), "retiring worn vm");
            drop(vm);
        } else {
            state.idle.push(vm);
            drop(state);
        }
        self.available.notify_one();
    }
}

/// Bounded pool of VMs shared by many caller threads
#[derive(Clone)]
pub struct Scheduler {
    pool: Arc<Pool>,
}

impl Scheduler {
    /// Create a scheduler and warm its initial VMs
    pub fn new(options: SchedulerOptions, modules: Arc<ModuleLoader>) -> VmResult<Self> {
        let options = options.normalized();
        let pool = Arc::new(Pool {
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(options.max_vms),
                created: 0,
                in_use: 0,
            }),
            available: Condvar::new(),
            next_id: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            modules,
            options,
        });

        for _ in 0..pool.options.initial_vms {
            let vm = pool.create_vm()?;
            let mut state = pool.state.lock();
            state.created += 1;
            state.idle.push(vm);
        }

        debug!(
            initial = pool.options.initial_vms,
            max = pool.options.max_vms,
            "scheduler started"
        );
        Ok(Self { pool })
    }

    /// Effective options, defaults applied
    pub fn options(&self) -> &SchedulerOptions {
        &self.pool.options
    }

    /// The loader shared by every VM of this pool
    pub fn modules(&self) -> &Arc<ModuleLoader> {
        &self.pool.modules
    }

    /// Take a VM for exclusive use
    pub fn acquire(&self) -> VmResult<VmLease> {
        let pool = &self.pool;
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut state = pool.state.lock();

        loop {
            if let Some(vm) = state.idle.pop() {
                state.in_use += 1;
                drop(state);
                return Ok(self.lease(vm));
            }

            if state.created < pool.options.max_vms {
                state.created += 1;
                state.in_use += 1;
                let live = state.created;
                drop(state);

                return match pool.create_vm() {
                    Ok(vm) => {
                        debug!(vm = vm.id(), live, "pool grew");
                        Ok(self.lease(vm))
                    }
                    Err(err) => {
                        let mut state = pool.state.lock();
                        state.created -= 1;
                        state.in_use -= 1;
                        drop(state);
                        pool.available.notify_one();
                        Err(err)
                    }
                };
            }

            let waited = started.elapsed();
            let remaining = pool.options.max_wait.saturating_sub(waited);
            if attempt >= pool.options.max_retries || remaining.is_zero() {
                pool.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    retries = attempt,
                    waited_ms = waited.as_millis() as u64,
                    in_use = state.in_use,
                    "vm pool exhausted"
                );
                return Err(VmError::PoolExhausted {
                    retries: attempt,
                    waited,
                });
            }

            let wait = pool.options.backoff(attempt).min(remaining);
            pool.available.wait_for(&mut state, wait);
            attempt += 1;
        }
    }

    fn lease(&self, vm: Vm) -> VmLease {
        self.pool.acquired.fetch_add(1, Ordering::Relaxed);
        VmLease {
            vm: Some(vm),
            pool: self.pool.clone(),
        }
    }

    /// Acquire a VM and run `f` on it under `context`
    pub fn run<F, R>(&self, context: &RunContext, f: F) -> VmResult<R>
    where
        F: FnOnce(&mut Vm) -> VmResult<R>,
    {
        if let Some(err) = context.err() {
            return Err(err);
        }
        let mut lease = self.acquire()?;
        f(&mut lease)
    }

    /// Run a script on a pooled VM
    pub fn run_string(&self, context: &RunContext, source: &str) -> VmResult<serde_json::Value> {
        self.run(context, |vm| vm.run_string(context, source))
    }

    /// Require a module on a pooled VM and call its default export
    pub fn run_module(
        &self,
        context: &RunContext,
        specifier: &str,
        args: &[serde_json::Value],
    ) -> VmResult<serde_json::Value> {
        self.run(context, |vm| vm.run_module(context, specifier, args))
    }

    /// Current pool statistics
    pub fn stats(&self) -> SchedulerStats {
        let state = self.pool.state.lock();
        SchedulerStats {
            created: state.created,
            idle: state.idle.len(),
            in_use: state.in_use,
            max_vms: self.pool.options.max_vms,
            acquired: self.pool.acquired.load(Ordering::Relaxed),
            exhausted: self.pool.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("stats", &self.stats()).finish()
    }
}

/// Exclusive handle on a pooled VM; dropping it returns the VM
pub struct VmLease {
    /// `Some` for the whole life of the lease; taken only by `drop`
    vm: Option<Vm>,
    pool: Arc<Pool>,
}

impl Deref for VmLease {
    type Target = Vm;

    fn deref(&self) -> &Vm {
        self.vm.as_ref().expect("lease holds its vm until dropped")
    }
}

impl DerefMut for VmLease {
    fn deref_mut(&mut self) -> &mut Vm {
        self.vm.as_mut().expect("lease holds its vm until dropped")
    }
}

impl Drop for VmLease {
    fn drop(&mut self) {
        if let Some(vm) = self.vm.take() {
            self.pool.release(vm);
        }
    }
}

impl std::fmt::Debug for VmLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmLease")
            .field("vm", &self.vm.as_ref().map(Vm::id))
            .finish()
    }
}
