//! Guarded-stack tests.

use crate::stack::{page_size, GuardedStack, StackFlags};

#[test]
fn page_size_is_sane() {
    let page = page_size();
    assert!(page >= 4096);
    assert!(page.is_power_of_two());
}

#[test]
fn allocation_rounds_to_pages_and_arms_guards() {
    let page = page_size();
    let stack = GuardedStack::allocate(page + 1);

    assert_eq!(stack.size(), 2 * page, "usable size rounds up to whole pages");
    assert_eq!(
        stack.flags(),
        StackFlags::GUARD_LOW | StackFlags::GUARD_HIGH,
        "both guard pages armed on the mmap path"
    );
    assert_eq!(stack.top() as usize - stack.base() as usize, stack.size());
    assert_eq!(stack.base() as usize % page, 0);
}

#[test]
fn stack_window_is_writable() {
    let stack = GuardedStack::allocate(page_size());
    // Touch both ends of the usable window; the guards sit outside it.
    unsafe {
        stack.base().write(0xAA);
        stack.top().sub(1).write(0xBB);
        assert_eq!(stack.base().read(), 0xAA);
        assert_eq!(stack.top().sub(1).read(), 0xBB);
    }
}

#[test]
fn contains_is_strict() {
    let stack = GuardedStack::allocate(page_size());
    let base = stack.base() as usize;
    let top = stack.top() as usize;

    assert!(!stack.contains(base), "base itself is excluded");
    assert!(stack.contains(base + 8));
    assert!(stack.contains(top - 8));
    assert!(!stack.contains(top), "one past the window is excluded");
    assert!(!stack.contains(base - 8), "low guard is outside");
}

#[test]
fn top_is_switch_aligned() {
    let stack = GuardedStack::allocate(page_size());
    assert_eq!(stack.top() as usize % 16, 0);
}
