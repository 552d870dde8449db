//! Transport layer.
//!
//! Reliable, ordered delivery of byte streams over UDP datagrams:
//!
//! - **Packet codec**: [`Header`], [`PacketType`] and the BEP 29 wire format
//! - **Sequence arithmetic**: 16-bit wrapping comparisons in [`seq`]
//! - **RTO estimation**: [`RtoEstimator`] with a 500 ms floor
//! - **Sliding window**: [`ConnectionState`] (send window, reorder buffer)
//! - **Connections**: [`Connection`], a locked state plus its collaborators
//! - **Async sockets**: [`UtpSocket`] wrapper for tokio UDP
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Upper layer (StreamDecoder)           │
//! ├─────────────────────────────────────────┤
//! │   Dispatch pool                         │
//! ├─────────────────────────────────────────┤
//! │   Transport Layer                       │  ← This module
//! │   packets, windows, RTO, handshake      │
//! ├─────────────────────────────────────────┤
//! │   UDP                                   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The codec, sequence helpers, estimator and window are plain data and
//! always compiled. Connections and sockets need the `transport` feature.

mod error;
mod packet;
pub mod seq;
mod timing;
mod window;

#[cfg(feature = "transport")]
mod connection;
#[cfg(feature = "transport")]
mod socket;
#[cfg(all(test, feature = "transport"))]
pub(crate) mod testing;

pub use error::*;
pub use packet::*;
pub use timing::RtoEstimator;
pub use window::*;

#[cfg(feature = "transport")]
pub use connection::*;
#[cfg(feature = "transport")]
pub use socket::*;
