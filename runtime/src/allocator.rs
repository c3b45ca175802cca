//! Collector-boundary allocation.
//!
//! The runtime does not own a garbage collector; the embedding program links
//! a conservative collector and generated code routes every allocation
//! through this seam. Memory returned here is zeroed, never freed by the
//! runtime, and reclaimed (if at all) by the embedding collector.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::fatal;

/// Whether [`gc_init`] has run.
static GC_READY: AtomicBool = AtomicBool::new(false);

/// Mark the embedding collector as initialized.
///
/// Idempotent. Must be called once before any [`alloc`]; generated programs
/// call it first thing in `main`.
pub fn gc_init() {
    if !GC_READY.swap(true, Ordering::SeqCst) {
        log::debug!("collector boundary initialized");
    }
}

/// Allocate `size` bytes of zeroed, collector-owned memory.
///
/// Aborts on out-of-memory: generated code has no recovery path, and a null
/// return would resurface as a fault far from the cause.
pub fn alloc(size: usize) -> *mut u8 {
    // A zero-size request still has to return a distinct, valid pointer
    // (generated code compares and dereferences unconditionally).
    let size = size.max(1);
    let layout = match std::alloc::Layout::from_size_align(size, align_for(size)) {
        Ok(layout) => layout,
        Err(_) => fatal("allocation size overflows layout"),
    };
    // SAFETY: layout has non-zero size by construction.
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        fatal("out of memory");
    }
    ptr
}

/// Alignment for collector allocations: 16 for anything a generated
/// aggregate could hold, smaller for tiny cells.
fn align_for(size: usize) -> usize {
    if size >= 16 {
        16
    } else {
        size.next_power_of_two()
    }
}
