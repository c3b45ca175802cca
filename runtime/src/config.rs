//! Runtime configuration constants.
//!
//! This module contains compile-time configuration for the runtime.
//! Values here affect worker-pool shape, queue capacities, and stack limits.

/// Number of worker threads the scheduler drives.
pub const WORKERS: usize = 4;

/// Capacity of each per-worker run queue. Must be a power of two so that
/// free-running indices can be masked into slot positions.
pub const RUN_QUEUE_CAPACITY: usize = 256;

/// Minimum legion stack size (256 KiB).
pub const STACK_MIN: usize = 256 * 1024;

/// Maximum legion stack size (2 MiB).
pub const STACK_MAX: usize = 2 * 1024 * 1024;

/// Default legion stack size when the caller passes 0.
pub const STACK_DEFAULT: usize = STACK_MIN;

/// How long an idle worker sleeps on its condition variable before
/// re-scanning the queues (milliseconds).
pub const WORKER_PARK_TIMEOUT_MS: u64 = 10;

/// Extra sleep taken by a worker when no legion in the process is
/// runnable or blocked (milliseconds).
pub const IDLE_SLEEP_MS: u64 = 1;

/// How many times a dispatching worker spins on a legion's `on_cpu`
/// release before yielding the OS thread.
pub const DISPATCH_SPIN_LIMIT: u32 = 10_000;

const _: () = assert!(RUN_QUEUE_CAPACITY.is_power_of_two());
const _: () = assert!(STACK_MIN <= STACK_DEFAULT && STACK_DEFAULT <= STACK_MAX);
