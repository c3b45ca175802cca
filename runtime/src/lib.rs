//! Infernal language runtime.
//!
//! The support library the Infernal compiler links into every program:
//! an M:N user-space scheduler that multiplexes lightweight cooperative
//! tasks ("legions") onto a fixed pool of worker threads, and the bounded
//! blocking channel legions synchronize through.
//!
//! # Layers
//!
//! - [`sched::context`] — machine-level context switch (x86-64, aarch64)
//! - [`stack`] — guarded stack mapping
//! - [`sched`] — legions, run queues, workers
//! - [`ipc`] — the channel
//! - [`embed`] — the `extern "C"` surface generated code calls
//!
//! Rust embedders use the typed surface re-exported at the crate root;
//! generated code goes through [`embed`].

pub mod allocator;
pub mod config;
pub mod embed;
pub mod error;
pub mod ipc;
pub mod sched;
pub mod stack;

#[cfg(test)]
mod tests;

pub use error::RuntimeError;
pub use ipc::{channel, Channel, TryRecv};
pub use sched::{
    current_legion, current_worker, spawn, spawn_fn, start, start_on, yield_now, Legion, LegionId,
    LegionState,
};
