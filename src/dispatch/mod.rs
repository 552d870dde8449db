//! Dispatch queue pool.
//!
//! Reassembled byte streams are handed to a fixed set of worker queues so
//! that slow upper-layer decoding never runs on the network receive path.

mod pool;

pub use pool::*;
