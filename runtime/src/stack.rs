//! Legion stack allocation.
//!
//! Every legion runs on its own stack, mapped with a `PROT_NONE` page on
//! both ends so that overflow and underflow trap deterministically instead
//! of scribbling over a neighbour. When the kernel refuses the mapping the
//! allocator falls back to a plain heap block without guards; the legion
//! still runs, it just loses the trap.

use core::ptr;

use bitflags::bitflags;

bitflags! {
    /// Which guard pages actually back a stack.
    ///
    /// The fallback path installs none; a failed `mprotect` can leave
    /// just one side armed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StackFlags: u8 {
        /// `PROT_NONE` page below the usable window (overflow trap).
        const GUARD_LOW = 1 << 0;
        /// `PROT_NONE` page above the usable window (underflow trap).
        const GUARD_HIGH = 1 << 1;
    }
}

/// How the stack memory is backed.
enum Backing {
    /// Anonymous mapping; the whole region (guards included) is unmapped
    /// on drop.
    Mapped { map_base: *mut u8, map_len: usize },
    /// Heap block kept alive for the stack's lifetime.
    Heap(#[allow(dead_code)] Box<[u8]>),
}

/// A downward-growing stack region for one legion.
pub struct GuardedStack {
    /// Lowest usable address.
    base: *mut u8,
    /// Usable size in bytes.
    size: usize,
    flags: StackFlags,
    backing: Backing,
}

impl GuardedStack {
    /// Allocate a stack with `size` usable bytes (rounded up to whole
    /// pages) and a guard page on each side.
    ///
    /// Never fails outright: if the mapping cannot be established the
    /// stack degrades to an unguarded heap block and the condition is
    /// logged.
    pub fn allocate(size: usize) -> GuardedStack {
        let page = page_size();
        let size = round_up(size, page);

        match Self::map_guarded(size, page) {
            Some(stack) => stack,
            None => {
                log::warn!("guarded stack mapping failed; falling back to heap ({size} bytes)");
                let block = vec![0u8; size].into_boxed_slice();
                let base = block.as_ptr() as *mut u8;
                GuardedStack {
                    base,
                    size,
                    flags: StackFlags::empty(),
                    backing: Backing::Heap(block),
                }
            }
        }
    }

    fn map_guarded(size: usize, page: usize) -> Option<GuardedStack> {
        let map_len = size.checked_add(2 * page)?;

        // SAFETY: anonymous private mapping, no fd, offset 0.
        let map_base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map_base == libc::MAP_FAILED {
            return None;
        }
        let map_base = map_base as *mut u8;

        let mut flags = StackFlags::empty();
        // SAFETY: both ranges lie inside the mapping established above.
        unsafe {
            if libc::mprotect(map_base as *mut libc::c_void, page, libc::PROT_NONE) == 0 {
                flags |= StackFlags::GUARD_LOW;
            }
            let high = map_base.add(page + size);
            if libc::mprotect(high as *mut libc::c_void, page, libc::PROT_NONE) == 0 {
                flags |= StackFlags::GUARD_HIGH;
            }
        }
        if flags != StackFlags::GUARD_LOW | StackFlags::GUARD_HIGH {
            log::warn!("stack guard mprotect incomplete: {flags:?}");
        }

        // SAFETY: page < map_len.
        let base = unsafe { map_base.add(page) };
        Some(GuardedStack {
            base,
            size,
            flags,
            backing: Backing::Mapped { map_base, map_len },
        })
    }

    /// Lowest usable address.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the highest usable address. Stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: base + size is the end of the usable window.
        unsafe { self.base.add(self.size) }
    }

    /// Which guard pages are armed.
    pub fn flags(&self) -> StackFlags {
        self.flags
    }

    /// Whether `addr` lies strictly inside the usable window.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr > base && addr < base + self.size
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        if let Backing::Mapped { map_base, map_len } = self.backing {
            // SAFETY: exactly the region returned by mmap in map_guarded.
            unsafe {
                libc::munmap(map_base as *mut libc::c_void, map_len);
            }
        }
    }
}

/// Install the default `SIGSEGV` disposition with `SA_ONSTACK` set.
///
/// A stack overflow lands on a guard page and raises `SIGSEGV`; the process
/// must die rather than limp on. Registering the default handler explicitly
/// keeps the door open for a future alternate-stack reporter without
/// changing the call sites.
pub fn install_overflow_handler() {
    // SAFETY: sigaction with SIG_DFL is always valid; the struct is zeroed
    // and the mask emptied before use.
    unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        sa.sa_flags = libc::SA_ONSTACK;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut());
    }
}

/// Host page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}
