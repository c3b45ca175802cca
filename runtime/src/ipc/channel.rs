//! Bounded blocking channel.
//!
//! A circular byte buffer plus two park lists. Legions that would block
//! are parked in user space (linked into the list, marked blocked,
//! suspended); bare OS threads fall back to the condition variables. Both
//! kinds of waiter can share one channel, which the embedding needs
//! because the program's main thread is not a legion.
//!
//! The one ordering rule that keeps the scheduler alive: a parking legion
//! links itself, marks itself blocked, **unlocks the mutex, and only then
//! yields**. Waking runs the other way around: `unblock` is called with
//! the mutex held but touches scheduler state only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use crate::error::fatal;
use crate::sched::{self, Legion};

/// Outcome of a non-blocking receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryRecv {
    /// One value, copied out.
    Value(Vec<u8>),
    /// Nothing buffered; the channel is still open.
    Empty,
    /// Closed and drained.
    Closed,
}

impl TryRecv {
    /// True when a value was received.
    pub fn is_value(&self) -> bool {
        matches!(self, TryRecv::Value(_))
    }
}

/// Mutable channel state, all guarded by the one mutex.
struct ChannelInner {
    /// `elem_size * capacity` bytes, used as a ring.
    buf: Box<[u8]>,
    /// Read position, in elements.
    head: usize,
    /// Write position, in elements.
    tail: usize,
    /// Buffered elements. Always ≤ capacity.
    count: usize,
    /// Legions waiting for space, FIFO.
    parked_senders: VecDeque<Arc<Legion>>,
    /// Legions waiting for a value, FIFO.
    parked_receivers: VecDeque<Arc<Legion>>,
}

/// A bounded channel of fixed-size values.
pub struct Channel {
    elem_size: usize,
    capacity: usize,
    /// Monotonic: set once by `close`, never cleared. Written under the
    /// mutex, readable without it.
    closed: AtomicBool,
    inner: Mutex<ChannelInner>,
    /// Wakes bare-thread senders.
    not_full: Condvar,
    /// Wakes bare-thread receivers.
    not_empty: Condvar,
    /// Back-reference handed to legions that park here.
    self_weak: Weak<Channel>,
}

impl Channel {
    /// Create a channel. `capacity == 0` is a programmer error and aborts.
    pub fn new(elem_size: usize, capacity: usize) -> Arc<Channel> {
        if capacity == 0 {
            fatal("channel capacity must be at least 1");
        }
        let bytes = match elem_size.checked_mul(capacity) {
            Some(b) => b,
            None => fatal("channel buffer size overflows"),
        };
        Arc::new_cyclic(|self_weak| Channel {
            elem_size,
            capacity,
            closed: AtomicBool::new(false),
            inner: Mutex::new(ChannelInner {
                buf: vec![0u8; bytes].into_boxed_slice(),
                head: 0,
                tail: 0,
                count: 0,
                parked_senders: VecDeque::new(),
                parked_receivers: VecDeque::new(),
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            self_weak: self_weak.clone(),
        })
    }

    /// Element size in bytes, fixed at creation.
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Capacity in elements, fixed at creation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered element count.
    pub fn len(&self) -> usize {
        self.lock().count
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of legions parked waiting for space.
    pub fn parked_senders(&self) -> usize {
        self.lock().parked_senders.len()
    }

    /// Number of legions parked waiting for a value.
    pub fn parked_receivers(&self) -> usize {
        self.lock().parked_receivers.len()
    }

    /// Whether the channel has been closed. Unlocked read.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one value, blocking while the channel is full.
    ///
    /// A send to a closed channel is dropped silently; that is defined
    /// behavior, not an error.
    pub fn send(&self, value: &[u8]) {
        self.check_elem_len(value.len());
        loop {
            let mut inner = self.lock();
            if self.is_closed() {
                return;
            }
            if inner.count < self.capacity {
                self.deposit(&mut inner, value);
                self.wake_one_receiver(&mut inner);
                return;
            }
            // Full: park.
            match sched::current_legion() {
                Some(me) => {
                    inner.parked_senders.push_back(me.clone());
                    sched::block(&me, self.self_weak.clone());
                    drop(inner);
                    sched::yield_now();
                    // Re-lock and re-test on resume.
                }
                None => {
                    let _relock = self
                        .not_full
                        .wait(inner)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Receive one value, blocking while the channel is empty.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub fn recv(&self) -> Option<Vec<u8>> {
        loop {
            let mut inner = self.lock();
            if inner.count > 0 {
                let value = self.withdraw(&mut inner);
                self.wake_one_sender(&mut inner);
                return Some(value);
            }
            if self.is_closed() {
                return None;
            }
            // Empty: park.
            match sched::current_legion() {
                Some(me) => {
                    inner.parked_receivers.push_back(me.clone());
                    sched::block(&me, self.self_weak.clone());
                    drop(inner);
                    sched::yield_now();
                }
                None => {
                    let _relock = self
                        .not_empty
                        .wait(inner)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Non-blocking send. `false` means the channel was full.
    ///
    /// On a closed channel the value is dropped and the send reports
    /// success, matching [`Channel::send`].
    pub fn try_send(&self, value: &[u8]) -> bool {
        self.check_elem_len(value.len());
        let mut inner = self.lock();
        if self.is_closed() {
            return true;
        }
        if inner.count == self.capacity {
            return false;
        }
        self.deposit(&mut inner, value);
        self.wake_one_receiver(&mut inner);
        true
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> TryRecv {
        let mut inner = self.lock();
        if inner.count > 0 {
            let value = self.withdraw(&mut inner);
            self.wake_one_sender(&mut inner);
            return TryRecv::Value(value);
        }
        if self.is_closed() {
            TryRecv::Closed
        } else {
            TryRecv::Empty
        }
    }

    /// Close the channel. Monotonic; further sends are dropped, receives
    /// drain the buffer and then report closure.
    ///
    /// Parked legions are not drained here: they re-test closure on their
    /// next wakeup cycle. The broadcasts cover bare-thread waiters.
    pub fn close(&self) {
        let _inner = self.lock();
        self.closed.store(true, Ordering::Release);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    // ==================== Typed helpers ====================

    /// Send a plain value; its size must equal the channel's element size.
    pub fn send_value<T: Copy>(&self, value: T) {
        self.send(value_bytes(&value));
    }

    /// Receive a plain value.
    pub fn recv_value<T: Copy>(&self) -> Option<T> {
        self.check_elem_len(core::mem::size_of::<T>());
        self.recv().map(|bytes| {
            // SAFETY: recv returned exactly elem_size == size_of::<T>()
            // bytes, and T: Copy admits any bit pattern we put in.
            unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) }
        })
    }

    /// Non-blocking typed send; see [`Channel::try_send`].
    pub fn try_send_value<T: Copy>(&self, value: T) -> bool {
        self.try_send(value_bytes(&value))
    }

    // ==================== Internals ====================

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_elem_len(&self, len: usize) {
        if len != self.elem_size {
            fatal("channel element size mismatch");
        }
    }

    /// Copy a value into the ring. Caller verified `count < capacity`.
    fn deposit(&self, inner: &mut ChannelInner, value: &[u8]) {
        let at = inner.tail * self.elem_size;
        inner.buf[at..at + self.elem_size].copy_from_slice(value);
        inner.tail = (inner.tail + 1) % self.capacity;
        inner.count += 1;
    }

    /// Copy a value out of the ring. Caller verified `count > 0`.
    fn withdraw(&self, inner: &mut ChannelInner) -> Vec<u8> {
        let at = inner.head * self.elem_size;
        let value = inner.buf[at..at + self.elem_size].to_vec();
        inner.head = (inner.head + 1) % self.capacity;
        inner.count -= 1;
        value
    }

    /// Hand one blocked receiver back to the scheduler and signal any
    /// bare-thread receiver. Runs with the channel mutex held; `unblock`
    /// only touches scheduler state.
    fn wake_one_receiver(&self, inner: &mut ChannelInner) {
        if let Some(legion) = inner.parked_receivers.pop_front() {
            sched::unblock(legion);
        }
        self.not_empty.notify_one();
    }

    /// Counterpart of [`Channel::wake_one_receiver`] for senders.
    fn wake_one_sender(&self, inner: &mut ChannelInner) {
        if let Some(legion) = inner.parked_senders.pop_front() {
            sched::unblock(legion);
        }
        self.not_full.notify_one();
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("elem_size", &self.elem_size)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// View a value's bytes for the copy into the ring.
fn value_bytes<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: any T is readable as size_of::<T>() bytes for the lifetime
    // of the borrow.
    unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    }
}
