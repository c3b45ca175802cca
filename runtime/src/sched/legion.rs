//! Legion definition.
//!
//! A legion is the unit of concurrency: one cooperative task with its own
//! guarded stack and saved machine context. Legions are handed around as
//! `Arc<Legion>`; whoever holds the handle (a run-queue slot, a channel
//! park list, a dispatching worker, the embedding program) keeps the stack
//! alive.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::config::{STACK_DEFAULT, STACK_MAX, STACK_MIN};
use crate::ipc::Channel;
use crate::stack::GuardedStack;

use super::context::{Context, EntryFn};

/// Unique legion identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LegionId(pub u64);

/// Legion lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LegionState {
    /// Queued (or about to be queued) and safe to switch into.
    Runnable = 0,
    /// Live registers are in hardware on some worker; the saved context
    /// is stale.
    Running = 1,
    /// Parked on a channel; woken only by `unblock`.
    Blocked = 2,
    /// Entry returned. Terminal.
    Dead = 3,
}

impl LegionState {
    fn from_u8(v: u8) -> LegionState {
        match v {
            0 => LegionState::Runnable,
            1 => LegionState::Running,
            2 => LegionState::Blocked,
            _ => LegionState::Dead,
        }
    }
}

/// Id mint. Starts at 1; 0 is never a legion id.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A cooperative task.
pub struct Legion {
    /// Unique id.
    id: LegionId,
    /// Current [`LegionState`].
    state: AtomicU8,
    /// Entry point captured at spawn.
    entry: EntryFn,
    /// Argument delivered to the entry.
    arg: *mut c_void,
    /// Owned stack; unmapped when the last handle drops.
    stack: GuardedStack,
    /// Saved machine context. Written by the context switcher only; the
    /// state machine guarantees a single writer at a time.
    ctx: UnsafeCell<Context>,
    /// Channel this legion is parked on. Weak: it describes the legion,
    /// it does not keep the channel alive.
    blocked_on: spin::Mutex<Weak<Channel>>,
    /// Worker currently hosting the legion, −1 otherwise.
    worker: AtomicI32,
    /// Set while some worker is (or may still be) executing on this
    /// legion's stack. The next host must wait for the release; a parked
    /// legion can be re-queued before its final register save completes.
    on_cpu: AtomicBool,
}

// SAFETY: the raw fields (`arg`, the context cell, the stack pointers) are
// only touched under the scheduler's single-host discipline: exactly one
// worker executes or prepares a legion at a time, enforced by the state
// machine and the `on_cpu` handshake.
unsafe impl Send for Legion {}
unsafe impl Sync for Legion {}

impl Legion {
    /// Build a legion in `Runnable` state with a fresh context.
    ///
    /// `stack_size` is clamped to [`STACK_MIN`]..=[`STACK_MAX`]; 0 selects
    /// [`STACK_DEFAULT`]. The legion is not submitted to the scheduler;
    /// callers inspect and then `start` it.
    pub fn new(entry: EntryFn, arg: *mut c_void, stack_size: usize) -> Arc<Legion> {
        let size = if stack_size == 0 {
            STACK_DEFAULT
        } else {
            stack_size.clamp(STACK_MIN, STACK_MAX)
        };
        let stack = GuardedStack::allocate(size);
        // SAFETY: the stack top comes from a live allocation with the
        // whole window below it writable.
        let ctx = unsafe { Context::fresh(entry, arg, stack.top()) };

        let id = LegionId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        log::trace!("legion {} spawned (stack {} KiB)", id.0, size / 1024);

        Arc::new(Legion {
            id,
            state: AtomicU8::new(LegionState::Runnable as u8),
            entry,
            arg,
            stack,
            ctx: UnsafeCell::new(ctx),
            blocked_on: spin::Mutex::new(Weak::new()),
            worker: AtomicI32::new(-1),
            on_cpu: AtomicBool::new(false),
        })
    }

    /// Get the legion id.
    pub fn id(&self) -> LegionId {
        self.id
    }

    /// Get the current state.
    pub fn state(&self) -> LegionState {
        LegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Set the state unconditionally.
    pub(crate) fn set_state(&self, state: LegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Transition `from → to`; false when the legion was not in `from`.
    pub(crate) fn transition(&self, from: LegionState, to: LegionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Entry point captured at spawn.
    pub fn entry(&self) -> (EntryFn, *mut c_void) {
        (self.entry, self.arg)
    }

    /// The legion's stack region.
    pub fn stack(&self) -> &GuardedStack {
        &self.stack
    }

    /// Worker currently hosting this legion, −1 when unhosted.
    pub fn worker(&self) -> i32 {
        self.worker.load(Ordering::Relaxed)
    }

    pub(crate) fn set_worker(&self, worker: i32) {
        self.worker.store(worker, Ordering::Relaxed);
    }

    /// Channel the legion is blocked on, when state is `Blocked` and the
    /// channel is still alive.
    pub fn blocked_on(&self) -> Option<Arc<Channel>> {
        self.blocked_on.lock().upgrade()
    }

    pub(crate) fn set_blocked_on(&self, ch: Weak<Channel>) {
        *self.blocked_on.lock() = ch;
    }

    pub(crate) fn clear_blocked_on(&self) {
        *self.blocked_on.lock() = Weak::new();
    }

    /// Raw pointer to the saved context slot.
    ///
    /// Callers uphold the single-writer rule: only the hosting worker (or
    /// the legion itself while suspending) may pass this to the switcher.
    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    /// Whether a worker still owns this legion's stack.
    pub(crate) fn is_on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    /// Claim the stack for the calling worker.
    pub(crate) fn enter_cpu(&self) {
        self.on_cpu.store(true, Ordering::Release);
    }

    /// Release the stack after the switch back to the worker completed
    /// (the saved context is consistent from here on).
    pub(crate) fn leave_cpu(&self) {
        self.on_cpu.store(false, Ordering::Release);
    }
}

impl core::fmt::Debug for Legion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Legion")
            .field("id", &self.id.0)
            .field("state", &self.state())
            .field("worker", &self.worker())
            .finish()
    }
}
