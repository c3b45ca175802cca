//! Machine-level context switch.
//!
//! Only callee-saved registers are switched. Every suspension point in the
//! runtime is an ordinary function call (`yield_now`, a channel op, the
//! trampoline's fall-through), so the compiler has already spilled all
//! caller-saved state by ABI discipline; saving it again would be wasted
//! work.
//!
//! A fresh context is brought up through [`legion_start_trampoline`]: the
//! first switch into it "returns" to the trampoline, which finds the entry
//! function and its argument in two callee-saved registers, makes a normal
//! call, and drops into legion teardown when the entry returns.

use super::legion_exit;

/// Entry signature for legion bodies, shared with the embedding ABI.
pub type EntryFn = extern "C" fn(*mut core::ffi::c_void);

// ==================== x86-64 ====================

/// Saved execution context: callee-saved registers plus stack pointer.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Clone)]
#[repr(C)]
pub struct Context {
    /// Callee-saved registers (System V AMD64).
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    /// Stack pointer.
    pub rsp: u64,
    /// Entry address slot. Read only while preparing a fresh context; a
    /// resumed context finds its return address on its own stack.
    pub rip: u64,
}

/// Save the current callee-saved state into `*prev` and resume from `*next`.
///
/// Resume addresses live on the stacks themselves, not in the context
/// record: suspending leaves one behind via `call`, and [`Context::fresh`]
/// plants the trampoline's address on a new stack. Restoring `rsp` and
/// executing `ret` therefore continues either context correctly without
/// ever touching `rip` here.
///
/// # Safety
///
/// Both pointers must reference valid, distinct contexts; `*next` must be a
/// prepared fresh context or one previously filled by this function, and no
/// other thread may be executing on `next`'s stack.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_prev: *mut Context, _next: *const Context) {
    // SysV argument registers: `prev` arrives in rdi, `next` in rsi.
    core::arch::naked_asm!(
        // Outgoing side: spill the callee-saved file plus rsp into *prev.
        // No slot is written for the resume address — the `call` that got
        // us here already left it on the outgoing stack, exactly where
        // the saved rsp points.
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbx",
        "mov [rdi + 0x28], rbp",
        "mov [rdi + 0x30], rsp",
        // Incoming side: reload the same file from *next. Moving rsp is
        // the actual handoff; from that instruction on we stand on the
        // incoming stack, whose top word is wherever it should continue.
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbx, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        // Pops that top word and jumps through it: back into the call
        // site that suspended this context, or into the trampoline the
        // first time around.
        "ret",
    );
}

/// First code a legion ever runs.
///
/// The preparing side parked the entry function in `r12` and its argument
/// in `r13` (both callee-saved, so the restore above delivered them here
/// intact). The stack is 16-byte aligned at this point, which makes the
/// `call` below hand the entry an ABI-conformant frame.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub extern "C" fn legion_start_trampoline() {
    core::arch::naked_asm!(
        "mov rdi, r13",
        "call r12",
        // Entry returned: the legion is done.
        "call {exit}",
        exit = sym legion_exit,
    );
}

#[cfg(target_arch = "x86_64")]
impl Context {
    /// Prepare a context whose first resume enters the trampoline with
    /// `(entry, arg)` and a 16-byte-aligned stack.
    ///
    /// # Safety
    ///
    /// `stack_top` must be one past the end of a live stack region with at
    /// least one writable slot below it.
    pub unsafe fn fresh(entry: EntryFn, arg: *mut core::ffi::c_void, stack_top: *mut u8) -> Self {
        // Align, then push the trampoline as a fake return address: the
        // first switch's `ret` pops it, leaving rsp 16-byte aligned on
        // trampoline entry.
        let top = (stack_top as u64) & !0xF;
        let sp = top - 8;
        // SAFETY: per contract, the slot at `sp` is inside the stack.
        unsafe {
            core::ptr::write(sp as *mut u64, legion_start_trampoline as usize as u64);
        }

        Context {
            r15: 0,
            r14: 0,
            r13: arg as u64,
            r12: entry as usize as u64,
            rbx: 0,
            rbp: 0,
            rsp: sp,
            rip: legion_start_trampoline as usize as u64,
        }
    }
}

// ==================== aarch64 ====================

/// Saved execution context: callee-saved registers plus stack pointer.
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Default, Clone)]
#[repr(C)]
pub struct Context {
    /// Callee-saved registers (AAPCS64).
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    /// Frame pointer (x29).
    pub fp: u64,
    /// Link register (x30). Doubles as the entry address for a fresh
    /// context; the restore's `ret` branches through it.
    pub lr: u64,
    /// Stack pointer.
    pub sp: u64,
}

/// Save the current callee-saved state into `*prev` and resume from `*next`.
///
/// # Safety
///
/// Both pointers must reference valid, distinct contexts; `*next` must be a
/// prepared fresh context or one previously filled by this function, and no
/// other thread may be executing on `next`'s stack.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_prev: *mut Context, _next: *const Context) {
    // AAPCS64 argument registers: `prev` arrives in x0, `next` in x1.
    core::arch::naked_asm!(
        // Outgoing side: pair-store the callee-saved file into *prev. x30
        // holds our own return address, so spilling it records the resume
        // point with no extra slot; sp needs a scratch hop through x9.
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        // Incoming side: reload the same file from *next.
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        // Branches through the restored x30: back to the suspending call
        // site, or into the trampoline for a fresh context.
        "ret",
    );
}

/// First code a legion ever runs. Entry function in `x19`, argument in
/// `x20` (see [`Context::fresh`]).
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub extern "C" fn legion_start_trampoline() {
    core::arch::naked_asm!(
        "mov x0, x20",
        "blr x19",
        // Entry returned: the legion is done.
        "b {exit}",
        exit = sym legion_exit,
    );
}

#[cfg(target_arch = "aarch64")]
impl Context {
    /// Prepare a context whose first resume enters the trampoline with
    /// `(entry, arg)` and a 16-byte-aligned stack.
    ///
    /// # Safety
    ///
    /// `stack_top` must be one past the end of a live stack region.
    pub unsafe fn fresh(entry: EntryFn, arg: *mut core::ffi::c_void, stack_top: *mut u8) -> Self {
        Context {
            x19: entry as usize as u64,
            x20: arg as u64,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            lr: legion_start_trampoline as usize as u64,
            sp: (stack_top as u64) & !0xF,
        }
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("infernal-runtime supports x86-64 and aarch64 only");
