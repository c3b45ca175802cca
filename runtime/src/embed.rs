//! C embedding surface.
//!
//! The Infernal compiler code-generates calls against these symbols; they
//! are the ABI between generated programs and the runtime. Handles cross
//! the boundary as raw `Arc` pointers owned by the collector-managed
//! program — the runtime never reclaims what it hands out here.
//!
//! Conventions:
//! - booleans are `i8` (`0`/`1`)
//! - a null pointer is the closed-and-drained sentinel for receives
//! - sends to a closed channel are dropped silently

use core::ffi::c_void;
use std::sync::Arc;

use crate::allocator;
use crate::error::fatal;
use crate::ipc::{Channel, TryRecv};
use crate::sched::{self, EntryFn, Legion};

// ==================== Collector boundary ====================

/// Initialize the embedding collector boundary. Call once at startup,
/// before any allocation.
#[no_mangle]
pub extern "C" fn runtime_gc_init() {
    allocator::gc_init();
}

/// Allocate `size` zeroed, collector-owned bytes. Aborts on OOM.
#[no_mangle]
pub extern "C" fn runtime_alloc(size: usize) -> *mut c_void {
    allocator::alloc(size) as *mut c_void
}

// ==================== Scheduler ====================

/// Start the infernal scheduler. Idempotent.
#[no_mangle]
pub extern "C" fn runtime_scheduler_init() {
    sched::init();
}

/// Stop the scheduler and join all workers. Must run on an embedding
/// thread, never inside a legion.
#[no_mangle]
pub extern "C" fn runtime_scheduler_shutdown() {
    sched::shutdown();
}

// ==================== Legions ====================

/// Spawn a legion running `entry(arg)` on a `stack_size`-byte stack
/// (0 selects the default; the size is clamped to the configured range).
/// The legion is not yet scheduled; pass the handle to
/// [`runtime_legion_start`].
#[no_mangle]
pub extern "C" fn runtime_legion_spawn(
    entry: Option<EntryFn>,
    arg: *mut c_void,
    stack_size: usize,
) -> *const Legion {
    let entry = match entry {
        Some(f) => f,
        None => fatal("legion spawn with null entry"),
    };
    Arc::into_raw(sched::spawn(entry, arg, stack_size))
}

/// Submit a spawned legion to the scheduler. May be called from any
/// context; the caller keeps its handle.
///
/// # Safety
///
/// `legion` must be a live handle returned by [`runtime_legion_spawn`].
#[no_mangle]
pub unsafe extern "C" fn runtime_legion_start(legion: *const Legion) {
    if legion.is_null() {
        fatal("legion start with null handle");
    }
    // SAFETY: per contract the pointer came from Arc::into_raw in spawn;
    // bump the count so the scheduler gets its own handle and the caller
    // keeps the original.
    let legion = unsafe {
        Arc::increment_strong_count(legion);
        Arc::from_raw(legion)
    };
    if let Err(e) = sched::start(legion) {
        log::error!("legion start rejected: {e}");
    }
}

/// Yield the calling legion. No-op outside a legion.
#[no_mangle]
pub extern "C" fn runtime_legion_yield() {
    sched::yield_now();
}

/// The legion executing on this thread, null outside a legion. Borrowed,
/// not retained: valid while the legion runs.
#[no_mangle]
pub extern "C" fn runtime_get_current_legion() -> *const Legion {
    match sched::current_legion() {
        Some(legion) => Arc::as_ptr(&legion),
        None => core::ptr::null(),
    }
}

// ==================== Channels ====================

/// Create a channel of `capacity` elements, `elem_size` bytes each.
/// `capacity` must be at least 1 (aborts otherwise).
#[no_mangle]
pub extern "C" fn runtime_channel_new(elem_size: usize, capacity: usize) -> *const Channel {
    Arc::into_raw(Channel::new(elem_size, capacity))
}

/// Send one element, blocking while full. Dropped silently when closed.
///
/// # Safety
///
/// `ch` must be a live channel handle; `value` must point at `elem_size`
/// readable bytes.
#[no_mangle]
pub unsafe extern "C" fn runtime_channel_send(ch: *const Channel, value: *const c_void) {
    let ch = unsafe { channel_ref(ch) };
    let bytes = unsafe { value_slice(value, ch.elem_size()) };
    ch.send(bytes);
}

/// Receive one element, blocking while empty. Returns a fresh
/// collector-owned copy, or null once the channel is closed and drained.
///
/// # Safety
///
/// `ch` must be a live channel handle.
#[no_mangle]
pub unsafe extern "C" fn runtime_channel_recv(ch: *const Channel) -> *mut c_void {
    let ch = unsafe { channel_ref(ch) };
    match ch.recv() {
        Some(bytes) => copy_out(&bytes),
        None => core::ptr::null_mut(),
    }
}

/// Non-blocking send: 1 on success (including the closed-channel drop),
/// 0 when the channel is full.
///
/// # Safety
///
/// Same contract as [`runtime_channel_send`].
#[no_mangle]
pub unsafe extern "C" fn runtime_channel_try_send(ch: *const Channel, value: *const c_void) -> i8 {
    let ch = unsafe { channel_ref(ch) };
    let bytes = unsafe { value_slice(value, ch.elem_size()) };
    ch.try_send(bytes) as i8
}

/// Non-blocking receive: 1 with a value, 1 with `*value` null when closed
/// and drained, 0 when the channel is open but empty.
///
/// # Safety
///
/// `ch` must be a live channel handle; `value` must be writable.
#[no_mangle]
pub unsafe extern "C" fn runtime_channel_try_recv(
    ch: *const Channel,
    value: *mut *mut c_void,
) -> i8 {
    let ch = unsafe { channel_ref(ch) };
    if value.is_null() {
        fatal("channel try_recv with null out-pointer");
    }
    let (ok, out) = match ch.try_recv() {
        TryRecv::Value(bytes) => (1, copy_out(&bytes)),
        TryRecv::Closed => (1, core::ptr::null_mut()),
        TryRecv::Empty => (0, core::ptr::null_mut()),
    };
    // SAFETY: checked non-null above; caller guarantees writability.
    unsafe {
        *value = out;
    }
    ok
}

/// Close the channel. Monotonic.
///
/// # Safety
///
/// `ch` must be a live channel handle.
#[no_mangle]
pub unsafe extern "C" fn runtime_channel_close(ch: *const Channel) {
    unsafe { channel_ref(ch) }.close();
}

/// Whether the channel is closed (unlocked read).
///
/// # Safety
///
/// `ch` must be a live channel handle.
#[no_mangle]
pub unsafe extern "C" fn runtime_channel_is_closed(ch: *const Channel) -> i8 {
    unsafe { channel_ref(ch) }.is_closed() as i8
}

// ==================== Misc ====================

/// Sleep the calling OS thread for `nanoseconds` (select-polling helper
/// for generated code).
#[no_mangle]
pub extern "C" fn runtime_nanosleep(nanoseconds: i64) {
    if nanoseconds <= 0 {
        return;
    }
    let ts = libc::timespec {
        tv_sec: (nanoseconds / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanoseconds % 1_000_000_000) as libc::c_long,
    };
    // SAFETY: ts is a valid timespec; the remainder out-pointer may be
    // null.
    unsafe {
        libc::nanosleep(&ts, core::ptr::null_mut());
    }
}

// ==================== Helpers ====================

/// Borrow a channel from its raw handle without touching the count.
///
/// # Safety
///
/// `ch` must be a live `Arc<Channel>` pointer from
/// [`runtime_channel_new`].
unsafe fn channel_ref<'a>(ch: *const Channel) -> &'a Channel {
    if ch.is_null() {
        fatal("null channel handle");
    }
    // SAFETY: per contract.
    unsafe { &*ch }
}

/// View `len` bytes behind a C value pointer.
///
/// # Safety
///
/// `value` must point at `len` readable bytes (or `len` must be 0).
unsafe fn value_slice<'a>(value: *const c_void, len: usize) -> &'a [u8] {
    if len == 0 {
        return &[];
    }
    if value.is_null() {
        fatal("null channel value");
    }
    // SAFETY: per contract.
    unsafe { core::slice::from_raw_parts(value as *const u8, len) }
}

/// Copy received bytes into a fresh collector allocation.
fn copy_out(bytes: &[u8]) -> *mut c_void {
    let out = allocator::alloc(bytes.len().max(1));
    // SAFETY: alloc returned at least bytes.len() writable bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
    }
    out as *mut c_void
}
