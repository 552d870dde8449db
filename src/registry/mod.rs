//! Connection registry and timeout sweep.
//!
//! The [`ConnectionRegistry`] maps `(remote address, connection id)` to live
//! connections and is the single place where teardown happens. The sweep
//! enforces retransmission timeouts, retry caps, idleness and transport
//! availability over a registry snapshot.

mod registry;
mod sweep;

pub use registry::*;
pub use sweep::*;
