//! Inter-legion communication.
//!
//! One primitive: the bounded blocking channel. Channels carry fixed-size
//! values by copy and block the sending or receiving legion (or OS thread)
//! when full or empty.

pub mod channel;

pub use channel::{Channel, TryRecv};

use std::sync::Arc;

/// Create a channel carrying `elem_size`-byte values with room for
/// `capacity` of them. `capacity` must be at least 1.
pub fn channel(elem_size: usize, capacity: usize) -> Arc<Channel> {
    Channel::new(elem_size, capacity)
}
