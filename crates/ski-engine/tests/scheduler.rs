//! Integration tests for the VM pool

use serde_json::json;
use ski_engine::{
    ModuleLoader, ModuleRegistry, RunContext, Scheduler, SchedulerOptions, VmError, VmOptions,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn scheduler(max_vms: usize, max_wait: Duration) -> Scheduler {
    let loader = Arc::new(ModuleLoader::with_registry(ModuleRegistry::new()).unwrap());
    let options = SchedulerOptions {
        initial_vms: 1,
        max_vms,
        max_retries: 5,
        max_wait,
        vm: VmOptions::default(),
    };
    Scheduler::new(options, loader).unwrap()
}

#[test]
fn test_third_acquisition_waits_for_a_release() {
    let scheduler = scheduler(2, Duration::from_secs(5));
    let first = scheduler.acquire().unwrap();
    let second = scheduler.acquire().unwrap();
    let leased: HashSet<usize> = [first.id(), second.id()].into_iter().collect();

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let scheduler = scheduler.clone();
        let acquired = acquired.clone();
        thread::spawn(move || {
            let lease = scheduler.acquire().unwrap();
            acquired.store(true, Ordering::SeqCst);
            lease.id()
        })
    };

    thread::sleep(Duration::from_millis(150));
    assert!(!acquired.load(Ordering::SeqCst));

    drop(first);
    let id = waiter.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert!(leased.contains(&id));
    assert_eq!(scheduler.stats().created, 2);
}

#[test]
fn test_concurrent_runs_share_a_bounded_pool() {
    let scheduler = scheduler(2, Duration::from_secs(10));
    let script = "const end = Date.now() + 200; while (Date.now() < end) {} 'done'";

    let started = Instant::now();
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.run_string(&RunContext::background(), script))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), json!("done"));
    }

    // Two rounds: the third run had to wait for a VM.
    assert!(started.elapsed() >= Duration::from_millis(400));
    let stats = scheduler.stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.acquired, 3);
}

#[test]
fn test_exhaustion_is_an_error_not_a_hang() {
    let scheduler = scheduler(2, Duration::from_millis(100));
    let _first = scheduler.acquire().unwrap();
    let _second = scheduler.acquire().unwrap();

    let started = Instant::now();
    let err = scheduler.acquire().unwrap_err();
    assert!(matches!(err, VmError::PoolExhausted { .. }));
    assert!(!err.is_context_error());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(err.to_string().starts_with("vm pool exhausted"));
}

#[test]
fn test_deadline_inside_pool_frees_the_vm() {
    let scheduler = scheduler(1, Duration::from_millis(200));
    let context = RunContext::background().with_timeout(Duration::from_millis(100));
    assert!(matches!(
        scheduler.run_string(&context, "while (true) {}"),
        Err(VmError::DeadlineExceeded)
    ));
    assert_eq!(
        scheduler
            .run_string(&RunContext::background(), "6 * 7")
            .unwrap(),
        json!(42)
    );
}
