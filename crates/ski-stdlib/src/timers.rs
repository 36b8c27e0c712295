//! Timer thread and the `setTimeout` / `clearTimeout` / `sleep` globals
//!
//! One thread per stdlib instance waits for the next due timer with
//! condvar timeouts. Firing a timer resolves the callback registered with
//! the run's event loop, so the script callback runs on the VM like any
//! other payload.
//!
//! A timer never outlives its run: its wake time is capped at the run's
//! deadline, and timers still pending when the run ends are cleared.
//! Neither a capped nor a cleared timer calls back into the script; a
//! capped one reports the deadline to the run instead.
//!
//! Timer ids are shared by every VM using one stdlib, but `clearTimeout`
//! only reaches timers created by the calling run.

use parking_lot::{Condvar, Mutex};
use rquickjs::function::{Opt, Rest};
use rquickjs::{Array, Ctx, Function, Object, Promise, Value};
use ski_engine::{HostContext, HostGlobal, VmError};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest delay a timer waits; larger delays saturate to it
const MAX_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// Why a timer left the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    /// Its delay elapsed
    Due,
    /// The run deadline arrived first
    Capped,
    /// Cleared by the script, by the end of its run or on shutdown
    Cleared,
}

/// Called exactly once per timer
type Fire = Box<dyn FnOnce(TimerEvent) + Send>;

/// Entry in the timer heap
struct TimerEntry {
    wake_at: Instant,
    id: u64,
    /// Run that created the timer
    owner: u64,
    /// Woken by the run deadline rather than its own delay
    capped: bool,
    fire: Fire,
}

// Reverse ordering for min-heap (earliest wake time first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.id == other.id
    }
}

impl Eq for TimerEntry {}

struct TimerShared {
    pending: Mutex<BinaryHeap<TimerEntry>>,
    /// Wakes the timer thread when an entry is added or on shutdown
    notify: Condvar,
    shutdown: AtomicBool,
}

/// Timer thread
pub struct TimerThread {
    shared: Arc<TimerShared>,
    next_id: AtomicU64,
    /// Runs whose leftover timers are cleared when they end
    armed: Mutex<HashSet<u64>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Spawn the timer thread
    pub fn start() -> io::Result<Self> {
        let shared = Arc::new(TimerShared {
            pending: Mutex::new(BinaryHeap::new()),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("ski-timer".to_string())
            .spawn(move || run_loop(&worker))?;
        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            armed: Mutex::new(HashSet::new()),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Fire `fire` at `wake_at` on behalf of run `owner`; returns the
    /// timer id
    fn schedule(&self, owner: u64, wake_at: Instant, capped: bool, fire: Fire) -> u64 {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.shared.pending.lock().push(TimerEntry {
            wake_at,
            id,
            owner,
            capped,
            fire,
        });
        self.shared.notify.notify_one();
        id
    }

    /// Drop timer `id` of run `owner` if it has not fired yet
    pub fn cancel(&self, owner: u64, id: u64) -> bool {
        self.clear(|entry| entry.owner == owner && entry.id == id) > 0
    }

    /// Drop every unfired timer of run `owner`; returns how many
    pub fn cancel_run(&self, owner: u64) -> usize {
        self.armed.lock().remove(&owner);
        self.clear(|entry| entry.owner == owner)
    }

    fn clear(&self, matches: impl Fn(&TimerEntry) -> bool) -> usize {
        let removed: Vec<TimerEntry> = {
            let mut pending = self.shared.pending.lock();
            let (removed, kept) = std::mem::take(&mut *pending)
                .into_vec()
                .into_iter()
                .partition(|entry| matches(entry));
            *pending = BinaryHeap::from(kept);
            removed
        };
        let count = removed.len();
        for entry in removed {
            (entry.fire)(TimerEvent::Cleared);
        }
        count
    }

    /// Id of the active run, arranging for its leftover timers to be
    /// cleared when it ends
    fn owner(self: &Arc<Self>, host: &HostContext) -> Result<u64, VmError> {
        let run = host.run_id()?;
        if self.armed.lock().insert(run) {
            let timer = self.clone();
            let armed = host.on_run_end(move || {
                let cleared = timer.cancel_run(run);
                if cleared > 0 {
                    debug!(run, cleared, "cleared timers left by finished run");
                }
            });
            if let Err(err) = armed {
                self.armed.lock().remove(&run);
                return Err(err);
            }
        }
        Ok(run)
    }

    /// Timers not yet fired
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Stop the thread; unfired timers are dropped
    pub fn stop(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        self.shared.notify.notify_one();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        let leftover = std::mem::take(&mut *self.shared.pending.lock());
        for entry in leftover.into_vec() {
            (entry.fire)(TimerEvent::Cleared);
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: &TimerShared) {
    loop {
        let mut pending = shared.pending.lock();

        // Checked under the lock so a stop() between checks is not lost.
        if shared.shutdown.load(AtomicOrdering::Acquire) {
            break;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while pending.peek().is_some_and(|entry| entry.wake_at <= now) {
            if let Some(entry) = pending.pop() {
                due.push(entry);
            }
        }

        if !due.is_empty() {
            drop(pending);
            for entry in due {
                let event = if entry.capped {
                    TimerEvent::Capped
                } else {
                    TimerEvent::Due
                };
                (entry.fire)(event);
            }
            continue;
        }

        match pending.peek().map(|next| next.wake_at) {
            Some(wake_at) => {
                let timeout = wake_at.saturating_duration_since(now);
                shared.notify.wait_for(&mut pending, timeout);
            }
            None => shared.notify.wait(&mut pending),
        }
    }
    debug!("timer thread shutting down");
}

/// When a timer asked to wait `delay` wakes, and whether the deadline
/// capped it
fn wake_time(delay: Duration, deadline: Option<Instant>) -> (Instant, bool) {
    // Bounded by MAX_DELAY, so the sum stays within the clock's range.
    let requested = Instant::now() + delay.min(MAX_DELAY);
    match deadline {
        Some(deadline) if deadline < requested => (deadline, true),
        _ => (requested, false),
    }
}

/// Outcome of a timer that never ran its callback
fn expired(event: TimerEvent) -> Result<(), VmError> {
    match event {
        TimerEvent::Capped => Err(VmError::DeadlineExceeded),
        TimerEvent::Due | TimerEvent::Cleared => Ok(()),
    }
}

fn delay_of(ms: Option<f64>) -> Duration {
    match ms {
        Some(ms) if ms.is_finite() && ms > 0.0 => Duration::try_from_secs_f64(ms / 1_000.0)
            .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY)),
        _ => Duration::ZERO,
    }
}

/// Installs `setTimeout`, `clearTimeout` and `sleep`
pub struct TimersGlobal {
    timer: Arc<TimerThread>,
}

impl TimersGlobal {
    /// Serve timers from `timer`
    pub fn new(timer: Arc<TimerThread>) -> Self {
        Self { timer }
    }
}

impl HostGlobal for TimersGlobal {
    fn install<'js>(
        &self,
        ctx: &Ctx<'js>,
        globals: &Object<'js>,
        host: &HostContext,
    ) -> rquickjs::Result<()> {
        let (timer, h) = (self.timer.clone(), host.clone());
        globals.set(
            "setTimeout",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      callback: Function<'js>,
                      ms: Opt<f64>,
                      args: Rest<Value<'js>>|
                      -> rquickjs::Result<f64> {
                    let owner = timer.owner(&h).map_err(|err| err.throw(&ctx))?;
                    let resolver = h.register_callback().map_err(|err| err.throw(&ctx))?;
                    let (wake_at, capped) = wake_time(delay_of(ms.0), h.run_context().deadline());
                    let list = Array::new(ctx.clone())?;
                    for (index, arg) in args.0.into_iter().enumerate() {
                        list.set(index, arg)?;
                    }
                    let callback = h.keep(&ctx, callback.into_value())?;
                    let args = h.keep(&ctx, list.into_value())?;

                    let id = timer.schedule(
                        owner,
                        wake_at,
                        capped,
                        Box::new(move |event| {
                            if event != TimerEvent::Due {
                                // Kept values go with the run's slots.
                                resolver.resolve(move |_| expired(event));
                                return;
                            }
                            resolver.resolve(move |ctx| {
                                let call = || -> rquickjs::Result<()> {
                                    let callback: Function<'_> = callback.take(&ctx)?.get()?;
                                    let args: Array<'_> = args.take(&ctx)?.get()?;
                                    let args = args
                                        .iter::<Value<'_>>()
                                        .collect::<rquickjs::Result<Vec<_>>>()?;
                                    callback.call((Rest(args),))
                                };
                                call().map_err(|err| VmError::from_js(&ctx, err))
                            });
                        }),
                    );
                    Ok(id as f64)
                },
            )?,
        )?;

        let (timer, h) = (self.timer.clone(), host.clone());
        globals.set(
            "clearTimeout",
            Function::new(ctx.clone(), move |id: Opt<f64>| {
                let Some(id) = id.0.filter(|id| id.is_finite() && *id >= 1.0) else {
                    return;
                };
                if let Ok(owner) = h.run_id() {
                    timer.cancel(owner, id as u64);
                }
            })?,
        )?;

        let (timer, h) = (self.timer.clone(), host.clone());
        globals.set(
            "sleep",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, ms: Opt<f64>| -> rquickjs::Result<Promise<'js>> {
                    let owner = timer.owner(&h).map_err(|err| err.throw(&ctx))?;
                    let resolver = h.register_callback().map_err(|err| err.throw(&ctx))?;
                    let (wake_at, capped) = wake_time(delay_of(ms.0), h.run_context().deadline());
                    let (promise, resolve, _) = Promise::new(&ctx)?;
                    let resolve = h.keep(&ctx, resolve.into_value())?;

                    timer.schedule(
                        owner,
                        wake_at,
                        capped,
                        Box::new(move |event| {
                            resolver.resolve(move |ctx| {
                                if event != TimerEvent::Due {
                                    return expired(event);
                                }
                                resolve
                                    .take(&ctx)
                                    .and_then(|resolve| resolve.get::<Function<'_>>())
                                    .and_then(|resolve| resolve.call::<_, ()>(()))
                                    .map_err(|err| VmError::from_js(&ctx, err))
                            });
                        }),
                    );
                    Ok(promise)
                },
            )?,
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_timers_fire_in_wake_order() {
        let timer = TimerThread::start().unwrap();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();
        for (label, delay) in [("late", 60), ("early", 10), ("middle", 30)] {
            let tx = tx.clone();
            timer.schedule(
                1,
                now + Duration::from_millis(delay),
                false,
                Box::new(move |event| tx.send((label, event)).unwrap()),
            );
        }
        let fired: Vec<_> = (0..3).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(
            fired,
            vec![
                ("early", TimerEvent::Due),
                ("middle", TimerEvent::Due),
                ("late", TimerEvent::Due)
            ]
        );
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_cancel_fires_immediately_without_running() {
        let timer = TimerThread::start().unwrap();
        let (tx, rx) = mpsc::channel();
        let id = timer.schedule(
            1,
            Instant::now() + Duration::from_secs(60),
            false,
            Box::new(move |event| tx.send(event).unwrap()),
        );
        assert!(timer.cancel(1, id));
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)).unwrap(),
            TimerEvent::Cleared
        );
        assert!(!timer.cancel(1, id));
    }

    #[test]
    fn test_cancel_only_reaches_own_run() {
        let timer = TimerThread::start().unwrap();
        let (tx, rx) = mpsc::channel();
        let id = timer.schedule(
            1,
            Instant::now() + Duration::from_millis(20),
            false,
            Box::new(move |event| tx.send(event).unwrap()),
        );
        assert!(!timer.cancel(2, id));
        assert_eq!(timer.cancel_run(2), 0);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            TimerEvent::Due
        );
    }

    #[test]
    fn test_cancel_run_clears_all_of_its_timers() {
        let timer = TimerThread::start().unwrap();
        let (tx, rx) = mpsc::channel();
        for owner in [7, 7, 8] {
            let tx = tx.clone();
            timer.schedule(
                owner,
                Instant::now() + Duration::from_secs(60),
                false,
                Box::new(move |event| tx.send((owner, event)).unwrap()),
            );
        }
        assert_eq!(timer.cancel_run(7), 2);
        for _ in 0..2 {
            assert_eq!(
                rx.recv_timeout(Duration::from_millis(100)).unwrap(),
                (7, TimerEvent::Cleared)
            );
        }
        assert_eq!(timer.pending(), 1);

        // Settle the other run's timer while the receiver is still alive.
        assert_eq!(timer.cancel_run(8), 1);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)).unwrap(),
            (8, TimerEvent::Cleared)
        );
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_capped_timer_does_not_run() {
        let timer = TimerThread::start().unwrap();
        let (tx, rx) = mpsc::channel();
        timer.schedule(
            1,
            Instant::now() + Duration::from_millis(5),
            true,
            Box::new(move |event| tx.send(event).unwrap()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            TimerEvent::Capped
        );
    }

    #[test]
    fn test_stop_releases_pending_timers() {
        let timer = TimerThread::start().unwrap();
        let (tx, rx) = mpsc::channel();
        timer.schedule(
            1,
            Instant::now() + Duration::from_secs(60),
            false,
            Box::new(move |event| tx.send(event).unwrap()),
        );
        timer.stop();
        assert_eq!(rx.recv().unwrap(), TimerEvent::Cleared);
    }

    #[test]
    fn test_wake_time_is_capped_by_deadline() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let (wake_at, capped) = wake_time(Duration::from_secs(10), Some(deadline));
        assert!(capped);
        assert_eq!(wake_at, deadline);

        let (_, capped) = wake_time(Duration::from_millis(1), Some(deadline));
        assert!(!capped);
        let (_, capped) = wake_time(Duration::from_secs(10), None);
        assert!(!capped);

        let (wake_at, capped) = wake_time(Duration::MAX, None);
        assert!(!capped);
        assert!(wake_at > Instant::now() + Duration::from_secs(86_400));
    }

    #[test]
    fn test_delay_of() {
        assert_eq!(delay_of(None), Duration::ZERO);
        assert_eq!(delay_of(Some(-5.0)), Duration::ZERO);
        assert_eq!(delay_of(Some(f64::NAN)), Duration::ZERO);
        assert_eq!(delay_of(Some(250.0)), Duration::from_millis(250));
        assert_eq!(delay_of(Some(1e23)), MAX_DELAY);
        assert_eq!(delay_of(Some(f64::MAX)), MAX_DELAY);
        assert_eq!(delay_of(Some(f64::INFINITY)), Duration::ZERO);
    }
}
