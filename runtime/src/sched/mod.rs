//! The infernal scheduler.
//!
//! An M:N multiplexer: a fixed pool of worker threads drives an arbitrary
//! number of legions. Each worker owns a bounded run queue; idle workers
//! steal from their neighbours, then park on a condition variable with a
//! short timeout. Legions suspend only at well-defined points (an explicit
//! yield, a full/empty channel, death), so within one worker the scheduling
//! is strictly cooperative.

pub mod context;
pub mod legion;
pub(crate) mod queue;

use core::ffi::c_void;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::config::{
    DISPATCH_SPIN_LIMIT, IDLE_SLEEP_MS, RUN_QUEUE_CAPACITY, WORKERS, WORKER_PARK_TIMEOUT_MS,
};
use crate::error::{fatal, RuntimeError};
use crate::ipc::Channel;
use crate::stack;

pub use context::{Context, EntryFn};
pub use legion::{Legion, LegionId, LegionState};

use queue::RunQueue;

/// Global scheduler instance.
static SCHEDULER: spin::Mutex<Option<Arc<Scheduler>>> = spin::Mutex::new(None);

/// Total context switches counter (dispatches and suspensions).
static CONTEXT_SWITCHES: AtomicU64 = AtomicU64::new(0);

/// Spawned minus dead minus blocked legions. Purely an idle heuristic for
/// the workers; decremented on block, re-incremented on unblock.
static ACTIVE_LEGIONS: AtomicI64 = AtomicI64::new(0);

lazy_static! {
    /// All legions ever spawned, by id. Weak handles: the registry is a
    /// diagnostic index, not an owner. Pruned opportunistically.
    static ref REGISTRY: spin::Mutex<HashMap<u64, Weak<Legion>>> =
        spin::Mutex::new(HashMap::new());
}

thread_local! {
    /// Worker id of this OS thread, −1 off the pool.
    static WORKER_ID: Cell<i32> = const { Cell::new(-1) };
    /// This worker's scheduler-context slot; switch-back target for
    /// suspending legions.
    static SCHED_CTX: Cell<*mut Context> = const { Cell::new(core::ptr::null_mut()) };
    /// Legion currently executing on this worker.
    static CURRENT: RefCell<Option<Arc<Legion>>> = const { RefCell::new(None) };
}

/// Per-worker shared state.
struct Worker {
    /// Runnable legions owned by this worker (and stolen from by others).
    queue: RunQueue,
    /// Used solely to wake a parked worker; never guards queue data.
    park_lock: StdMutex<()>,
    park_cond: Condvar,
}

impl Worker {
    fn new() -> Worker {
        Worker {
            queue: RunQueue::new(),
            park_lock: StdMutex::new(()),
            park_cond: Condvar::new(),
        }
    }

    /// Nudge the worker out of its timed park. Taking the lock pairs the
    /// notify with the parker's re-test, so no wakeup is lost.
    fn wake(&self) {
        let _guard = self.park_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.park_cond.notify_one();
    }
}

/// The scheduler implementation: worker pool, queues, process-wide
/// counters.
pub struct Scheduler {
    workers: Vec<Worker>,
    shutdown: AtomicBool,
    joins: StdMutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    fn new() -> Scheduler {
        Scheduler {
            workers: (0..WORKERS).map(|_| Worker::new()).collect(),
            shutdown: AtomicBool::new(false),
            joins: StdMutex::new(Vec::new()),
        }
    }

    /// Queue lengths across the pool. Approximate by design.
    fn queue_lens(&self) -> [usize; WORKERS] {
        let mut lens = [0usize; WORKERS];
        for (i, w) in self.workers.iter().enumerate() {
            lens[i] = w.queue.len();
        }
        lens
    }

    /// Least-loaded worker index.
    fn least_loaded(&self) -> usize {
        let lens = self.queue_lens();
        let mut best = 0;
        for (i, &len) in lens.iter().enumerate() {
            if len < lens[best] {
                best = i;
            }
        }
        best
    }

    /// Place a legion on `preferred`, spilling to any other ring on
    /// overflow and spinning across the pool until one accepts. At ring
    /// capacity 256 per worker the spin never triggers in practice.
    fn submit(&self, mut legion: Arc<Legion>, preferred: usize) {
        debug_assert_eq!(legion.state(), LegionState::Runnable);
        let mut target = preferred;
        let mut round = 0usize;
        loop {
            match self.workers[target].queue.push(legion) {
                Ok(()) => {
                    self.workers[target].wake();
                    return;
                }
                Err(back) => legion = back,
            }
            round += 1;
            target = (preferred + round) % WORKERS;
            if round % WORKERS == 0 {
                std::hint::spin_loop();
            }
        }
    }
}

// ==================== Lifecycle ====================

/// Initialize the scheduler and spawn the worker pool.
///
/// Idempotent: a second call while the pool is up is a no-op.
pub fn init() {
    let mut slot = SCHEDULER.lock();
    if slot.is_some() {
        return;
    }

    stack::install_overflow_handler();

    let sched = Arc::new(Scheduler::new());
    let mut joins = Vec::with_capacity(WORKERS);
    for t in 0..WORKERS {
        let s = sched.clone();
        let handle = std::thread::Builder::new()
            .name(format!("infernal-worker-{t}"))
            .spawn(move || worker_main(s, t))
            .unwrap_or_else(|e| fatal(&format!("cannot spawn worker thread: {e}")));
        joins.push(handle);
    }
    *sched.joins.lock().unwrap_or_else(|e| e.into_inner()) = joins;
    *slot = Some(sched);

    log::info!("scheduler online: {WORKERS} workers, ring capacity {RUN_QUEUE_CAPACITY}");
}

/// Stop the worker pool and wait for every worker to exit.
///
/// Legions still runnable or blocked are abandoned (their handles are
/// reclaimed as queues drop). Must be called from an embedding thread, not
/// from inside a legion.
pub fn shutdown() {
    let sched = {
        let slot = SCHEDULER.lock();
        match &*slot {
            Some(s) => s.clone(),
            None => return,
        }
    };

    sched.shutdown.store(true, Ordering::SeqCst);
    for w in &sched.workers {
        w.wake();
    }
    let joins = std::mem::take(&mut *sched.joins.lock().unwrap_or_else(|e| e.into_inner()));
    for handle in joins {
        let _ = handle.join();
    }

    *SCHEDULER.lock() = None;
    log::info!("scheduler stopped");
}

/// Whether the scheduler is up.
pub fn is_initialized() -> bool {
    SCHEDULER.lock().is_some()
}

fn scheduler() -> Result<Arc<Scheduler>, RuntimeError> {
    SCHEDULER
        .lock()
        .as_ref()
        .cloned()
        .ok_or(RuntimeError::NotInitialized)
}

// ==================== Spawning and placement ====================

/// Allocate a legion. Does not enqueue it; pair with [`start`].
///
/// The spawn/start split lets callers inspect a legion before it runs.
pub fn spawn(entry: EntryFn, arg: *mut c_void, stack_size: usize) -> Arc<Legion> {
    let legion = Legion::new(entry, arg, stack_size);
    REGISTRY
        .lock()
        .insert(legion.id().0, Arc::downgrade(&legion));
    ACTIVE_LEGIONS.fetch_add(1, Ordering::SeqCst);
    legion
}

/// Spawn a legion from a Rust closure.
///
/// The closure is boxed behind the C entry signature; the box is consumed
/// on first (and only) execution.
pub fn spawn_fn<F>(f: F, stack_size: usize) -> Arc<Legion>
where
    F: FnOnce() + Send + 'static,
{
    extern "C" fn closure_entry(arg: *mut c_void) {
        // SAFETY: arg is the Box<Box<dyn FnOnce()>> leaked below; this
        // entry runs exactly once per spawn.
        let f = unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce() + Send>) };
        f();
    }

    let boxed: Box<Box<dyn FnOnce() + Send>> = Box::new(Box::new(f));
    spawn(closure_entry, Box::into_raw(boxed) as *mut c_void, stack_size)
}

/// Submit a runnable legion to the least-loaded worker.
pub fn start(legion: Arc<Legion>) -> Result<(), RuntimeError> {
    if legion.state() != LegionState::Runnable {
        return Err(RuntimeError::InvalidState);
    }
    let sched = scheduler()?;
    let target = sched.least_loaded();
    sched.submit(legion, target);
    Ok(())
}

/// Submit a runnable legion to a specific worker's queue.
pub fn start_on(legion: Arc<Legion>, worker: usize) -> Result<(), RuntimeError> {
    if worker >= WORKERS {
        return Err(RuntimeError::NoSuchWorker);
    }
    if legion.state() != LegionState::Runnable {
        return Err(RuntimeError::InvalidState);
    }
    let sched = scheduler()?;
    sched.submit(legion, worker);
    Ok(())
}

// ==================== Suspension points ====================

/// Yield the current legion back to its worker.
///
/// A running legion goes back to `Runnable` and re-queues itself (local
/// ring preferred); a legion that was just marked `Blocked` by a channel
/// suspends without re-queueing. No-op outside a legion.
pub fn yield_now() {
    let legion = match CURRENT.with(|c| c.borrow_mut().take()) {
        Some(l) => l,
        None => return,
    };

    let sched_ctx = SCHED_CTX.with(|c| c.get());
    debug_assert!(!sched_ctx.is_null());

    match legion.state() {
        LegionState::Running => {
            let sched = match scheduler() {
                Ok(sched) => sched,
                // Workers are joined before the global slot clears, so a
                // missing scheduler here means a mis-hosted legion; keep
                // running rather than corrupt it.
                Err(_) => {
                    CURRENT.with(|c| *c.borrow_mut() = Some(legion));
                    return;
                }
            };
            legion.set_state(LegionState::Runnable);
            let worker = WORKER_ID.with(|w| w.get());
            sched.submit(legion.clone(), worker.max(0) as usize);
        }
        LegionState::Blocked => {
            // Parked on a channel; the counterpart re-queues it.
        }
        LegionState::Runnable => {
            // Parked on a channel and already woken: the counterpart ran
            // `unblock` inside the window between our unlock and this
            // switch, so a queue entry exists. Suspend without
            // re-queueing; the next host resumes us right here (it waits
            // on our `on_cpu` release first).
        }
        LegionState::Dead => {
            log::warn!("yield from dead legion {}", legion.id().0);
            CURRENT.with(|c| *c.borrow_mut() = Some(legion));
            return;
        }
    }

    CONTEXT_SWITCHES.fetch_add(1, Ordering::Relaxed);
    let ctx = legion.ctx_ptr();
    // SAFETY: ctx is this legion's own slot and sched_ctx is the hosting
    // worker's live context; we are executing on the legion's stack, so
    // saving into ctx and resuming the worker is exactly the handoff the
    // switcher exists for.
    unsafe {
        context::switch_context(ctx, sched_ctx);
    }
    // Resumed: some worker switched back into us. `CURRENT` was
    // re-published by its dispatch loop.
}

/// Mark the current legion blocked on `channel`.
///
/// Never switches; the caller must unlock everything it holds and then
/// call [`yield_now`]. The channel has already linked the legion into its
/// park list.
pub(crate) fn block(legion: &Arc<Legion>, channel: Weak<Channel>) {
    if !legion.transition(LegionState::Running, LegionState::Blocked) {
        log::warn!(
            "block of legion {} in state {:?}",
            legion.id().0,
            legion.state()
        );
        return;
    }
    legion.set_blocked_on(channel);
    ACTIVE_LEGIONS.fetch_sub(1, Ordering::SeqCst);
}

/// Move a blocked legion back to the run queues.
///
/// Called by the waking counterpart with the channel mutex held; this only
/// touches scheduler state, never the channel.
pub(crate) fn unblock(legion: Arc<Legion>) {
    if !legion.transition(LegionState::Blocked, LegionState::Runnable) {
        log::warn!(
            "unblock of legion {} in state {:?}",
            legion.id().0,
            legion.state()
        );
        return;
    }
    legion.clear_blocked_on();
    ACTIVE_LEGIONS.fetch_add(1, Ordering::SeqCst);
    match scheduler() {
        Ok(sched) => {
            let target = sched.least_loaded();
            sched.submit(legion, target);
        }
        Err(_) => {
            // Shutdown raced the wakeup; the legion is abandoned.
            log::debug!("unblock after shutdown: legion {} dropped", legion.id().0);
        }
    }
}

/// Teardown entry reached when a legion's entry function returns.
///
/// Runs on the dying legion's stack; performs the one-way switch back to
/// the hosting worker. The worker's `Arc` keeps the stack alive until the
/// switch has completed.
pub(crate) extern "C" fn legion_exit() -> ! {
    let legion = match CURRENT.with(|c| c.borrow_mut().take()) {
        Some(l) => l,
        None => fatal("legion teardown outside a legion"),
    };

    legion.set_state(LegionState::Dead);
    legion.clear_blocked_on();
    ACTIVE_LEGIONS.fetch_sub(1, Ordering::SeqCst);
    log::trace!("legion {} dead", legion.id().0);

    let ctx = legion.ctx_ptr();
    let sched_ctx = SCHED_CTX.with(|c| c.get());
    debug_assert!(!sched_ctx.is_null());
    // The worker's handle outlives this switch; ours must drop now or the
    // legion leaks with their stack.
    drop(legion);

    CONTEXT_SWITCHES.fetch_add(1, Ordering::Relaxed);
    // SAFETY: one-way switch off this stack; the saved context is never
    // resumed (state is Dead, and dead legions are never queued).
    unsafe {
        context::switch_context(ctx, sched_ctx);
    }
    unreachable!("dead legion resumed");
}

// ==================== Worker loop ====================

fn worker_main(sched: Arc<Scheduler>, t: usize) {
    WORKER_ID.with(|w| w.set(t as i32));
    let mut sched_ctx = Context::default();
    SCHED_CTX.with(|c| c.set(&mut sched_ctx));
    log::debug!("worker {t} up");

    'outer: while !sched.shutdown.load(Ordering::SeqCst) {
        // 1. Local pop.
        if let Some(legion) = sched.workers[t].queue.pop() {
            dispatch(t, &mut sched_ctx, legion);
            continue;
        }

        // 2. Steal rotation.
        for k in 1..WORKERS {
            let victim = (t + k) % WORKERS;
            if let Some(legion) = sched.workers[victim].queue.pop() {
                log::trace!("worker {t} stole legion {} from {victim}", legion.id().0);
                dispatch(t, &mut sched_ctx, legion);
                continue 'outer;
            }
        }

        // 3. Timed park. Re-test under the lock: a producer may have
        // signalled between our empty observation and the lock.
        {
            let worker = &sched.workers[t];
            let guard = worker.park_lock.lock().unwrap_or_else(|e| e.into_inner());
            if !worker.queue.is_empty() || sched.shutdown.load(Ordering::SeqCst) {
                continue;
            }
            let _ = worker
                .park_cond
                .wait_timeout(guard, Duration::from_millis(WORKER_PARK_TIMEOUT_MS));
        }

        // 4. Nothing live anywhere: back off a little harder.
        if ACTIVE_LEGIONS.load(Ordering::SeqCst) <= 0 {
            std::thread::sleep(Duration::from_millis(IDLE_SLEEP_MS));
        }
    }

    log::debug!("worker {t} down");
}

/// Switch into a legion and host it until it suspends or dies.
fn dispatch(t: usize, sched_ctx: &mut Context, legion: Arc<Legion>) {
    // A freshly re-queued legion may still be saving its registers on its
    // previous host; wait for the release.
    let mut spins = 0u32;
    while legion.is_on_cpu() {
        spins += 1;
        if spins > DISPATCH_SPIN_LIMIT {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }

    legion.enter_cpu();
    legion.set_worker(t as i32);
    legion.set_state(LegionState::Running);
    CURRENT.with(|c| *c.borrow_mut() = Some(legion.clone()));
    CONTEXT_SWITCHES.fetch_add(1, Ordering::Relaxed);

    // SAFETY: sched_ctx is this worker's own slot; the legion's context is
    // runnable (fresh, or saved by a completed suspension — guaranteed by
    // the on_cpu handshake above) and no other worker can hold it, because
    // a queue pop yields exclusive ownership.
    unsafe {
        context::switch_context(sched_ctx as *mut Context, legion.ctx_ptr());
    }

    // Back in the worker: the legion yielded, parked, or died. Its current
    // slot was cleared on the way out.
    debug_assert!(CURRENT.with(|c| c.borrow().is_none()));
    legion.set_worker(-1);
    legion.leave_cpu();
}

// ==================== Introspection ====================

/// The legion currently executing on this thread.
pub fn current_legion() -> Option<Arc<Legion>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Worker id of this thread, −1 off the pool.
pub fn current_worker() -> i32 {
    WORKER_ID.with(|w| w.get())
}

/// Total context switches performed so far.
pub fn context_switch_count() -> u64 {
    CONTEXT_SWITCHES.load(Ordering::Relaxed)
}

/// Spawned-minus-retired legion count (the idle heuristic).
pub fn active_legions() -> i64 {
    ACTIVE_LEGIONS.load(Ordering::SeqCst)
}

/// Number of legions whose handles are still alive.
pub fn legion_count() -> usize {
    let mut registry = REGISTRY.lock();
    registry.retain(|_, weak| weak.strong_count() > 0);
    registry.len()
}

/// Look up a live legion by id.
pub fn find_legion(id: LegionId) -> Option<Arc<Legion>> {
    REGISTRY.lock().get(&id.0).and_then(Weak::upgrade)
}

/// Current queue lengths across the pool (approximate).
pub fn queue_lens() -> [usize; WORKERS] {
    scheduler()
        .map(|s| s.queue_lens())
        .unwrap_or([0; WORKERS])
}
