//! High-level uTP endpoint API.
//!
//! An [`UtpEndpoint`] owns everything a running transport needs: the UDP
//! socket and its receive loop, the [`ConnectionRegistry`](crate::registry::ConnectionRegistry),
//! the sweep driver and the dispatch pool. Nothing is global; two endpoints
//! in one process are fully independent.

mod config;
mod endpoint;

pub use config::*;
pub use endpoint::*;
