//! Worker threads for blocking host work
//!
//! Host bindings hand blocking work (HTTP requests and the like) to a
//! fixed set of named threads fed by one channel, so the number of threads
//! stays bounded however many requests scripts start. The pool is shared
//! by every VM in the process and started on first use.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use std::thread;
use tracing::{debug, warn};

/// A unit of blocking work
pub(crate) type Job = Box<dyn FnOnce() + Send>;

static POOL: OnceLock<IoPool> = OnceLock::new();

/// Fixed-size pool of IO worker threads
pub(crate) struct IoPool {
    sender: Sender<Job>,
    workers: usize,
}

impl IoPool {
    /// Number of workers a new pool starts
    fn default_workers() -> usize {
        (num_cpus::get() * 2).clamp(4, 32)
    }

    /// Start a pool with `workers` threads
    fn start(workers: usize) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let mut started = 0;
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("ski-io-{}", index))
                .spawn(move || worker_loop(receiver));
            match spawned {
                Ok(_) => started += 1,
                Err(err) if started == 0 => return Err(err),
                Err(err) => {
                    warn!(error = %err, started, "io pool started short");
                    break;
                }
            }
        }
        debug!(workers = started, "io pool started");
        Ok(Self {
            sender,
            workers: started,
        })
    }

    /// The process-wide pool
    pub(crate) fn shared() -> std::io::Result<&'static IoPool> {
        if let Some(pool) = POOL.get() {
            return Ok(pool);
        }
        let pool = Self::start(Self::default_workers())?;
        // A pool that loses the race drops its sender; its workers exit.
        Ok(POOL.get_or_init(|| pool))
    }

    /// Queue `job` for the next free worker
    pub(crate) fn submit(&self, job: Job) {
        if self.sender.send(job).is_err() {
            warn!("io pool has no workers; job dropped");
        }
    }

    /// Threads serving this pool
    pub(crate) fn workers(&self) -> usize {
        self.workers
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    for job in receiver.iter() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("io job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_named_workers() {
        let pool = IoPool::start(2).unwrap();
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            }));
        }
        for _ in 0..4 {
            let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert!(name.starts_with("ski-io-"));
        }
        assert_eq!(pool.workers(), 2);
    }

    #[test]
    fn test_thread_count_is_bounded() {
        let pool = IoPool::start(3).unwrap();
        let (tx, rx) = mpsc::channel();
        for _ in 0..50 {
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(2));
                tx.send(thread::current().id()).unwrap();
            }));
        }
        let mut threads: Vec<_> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        threads.sort_by_key(|id| format!("{:?}", id));
        threads.dedup();
        assert!(threads.len() <= 3);
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let pool = IoPool::start(1).unwrap();
        pool.submit(Box::new(|| panic!("job failed")));
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
