//! Scenario test harness.
//!
//! The scheduler is a process-wide singleton, so scenarios inside one test
//! binary must not overlap: [`runtime`] hands out a guard that serializes
//! them and tears the pool down when the scenario finishes.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Serializes scenarios within a test binary.
static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

/// A running scheduler, exclusive to one scenario.
pub struct RuntimeGuard {
    _lock: MutexGuard<'static, ()>,
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        infernal_runtime::sched::shutdown();
    }
}

/// Bring the scheduler up for one scenario.
pub fn runtime() -> RuntimeGuard {
    let lock = RUNTIME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    infernal_runtime::sched::init();
    log::debug!("scenario runtime up");
    RuntimeGuard { _lock: lock }
}

/// How long scenarios wait before declaring a liveness failure.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll `cond` until it holds or [`SCENARIO_TIMEOUT`] expires.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SCENARIO_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Spawn a closure as a legion and start it immediately.
pub fn go(f: impl FnOnce() + Send + 'static) {
    let legion = infernal_runtime::spawn_fn(f, 0);
    infernal_runtime::start(legion).expect("scheduler is up");
}

/// Spawn a closure pinned to one worker's queue.
pub fn go_on(worker: usize, f: impl FnOnce() + Send + 'static) {
    let legion = infernal_runtime::spawn_fn(f, 0);
    infernal_runtime::start_on(legion, worker).expect("scheduler is up");
}
