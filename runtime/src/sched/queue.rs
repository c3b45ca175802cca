//! Per-worker run queue.
//!
//! A bounded ring of legion slots. Consumers (the owning worker popping,
//! any other worker stealing) share one lock-free path: snapshot the
//! indices, read the slot, CAS-advance `head`. Producers are serialized by
//! a spin lock because submission may come from any thread, then publish
//! with a release store of `tail`.
//!
//! Indices run freely and are masked into slot positions, so a thief's CAS
//! cannot ABA even after the ring wraps: empty ⟺ `head == tail`, full ⟺
//! `tail − head == capacity`.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::RUN_QUEUE_CAPACITY;

use super::legion::Legion;

const MASK: u32 = (RUN_QUEUE_CAPACITY - 1) as u32;

/// Bounded work-stealing queue of runnable legions.
pub(crate) struct RunQueue {
    /// Consumer index (next slot to pop/steal).
    head: AtomicU32,
    /// Producer index (next slot to fill).
    tail: AtomicU32,
    /// Serializes producers; consumers never take it.
    push_lock: spin::Mutex<()>,
    slots: [AtomicPtr<Legion>; RUN_QUEUE_CAPACITY],
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        RunQueue {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            push_lock: spin::Mutex::new(()),
            slots: [const { AtomicPtr::new(core::ptr::null_mut()) }; RUN_QUEUE_CAPACITY],
        }
    }

    /// Enqueue a legion. Returns it back to the caller when the ring is
    /// full; never blocks.
    pub(crate) fn push(&self, legion: Arc<Legion>) -> Result<(), Arc<Legion>> {
        let _guard = self.push_lock.lock();
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= RUN_QUEUE_CAPACITY as u32 {
            return Err(legion);
        }
        let ptr = Arc::into_raw(legion) as *mut Legion;
        self.slots[(tail & MASK) as usize].store(ptr, Ordering::Release);
        // Publishing tail makes the slot visible to consumers.
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeue one legion. Used identically by the owner (pop) and by
    /// thieves (steal): both CAS `head` forward, so there is no contention
    /// asymmetry between the two.
    pub(crate) fn pop(&self) -> Option<Arc<Legion>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            // Read before claiming: a successful CAS below proves nobody
            // else consumed this slot, and the producer cannot reuse it
            // until head has moved past it.
            let ptr = self.slots[(head & MASK) as usize].load(Ordering::Acquire);
            if self
                .head
                .compare_exchange(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                debug_assert!(!ptr.is_null());
                // SAFETY: the pointer was produced by Arc::into_raw in
                // push, and the CAS handed this slot to us exclusively.
                return Some(unsafe { Arc::from_raw(ptr) });
            }
            // Lost the race to another consumer; retry.
        }
    }

    /// Approximate number of queued legions. Racy by design; placement
    /// only needs a load estimate.
    pub(crate) fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        // Legions still queued at shutdown are abandoned; reclaim their
        // handles so the stacks unmap.
        while self.pop().is_some() {}
    }
}
