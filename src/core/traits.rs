//! Collaborator traits.
//!
//! The transport core talks to the outside world through two seams: a
//! datagram sink that puts bytes on the wire, and a stream decoder that
//! consumes reassembled bytes on a dispatch worker.

use std::io;
use std::net::SocketAddr;

use super::error::DecodeError;

/// Raw, unreliable datagram output.
///
/// Implementations are called while a connection lock is held, so
/// `send_to` MUST NOT block. Returning `WouldBlock` (or any other error) is
/// fine: the packet stays in the send window and the sweep retries it.
pub trait DatagramSink: Send + Sync + 'static {
    /// Send one datagram to `addr`.
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    /// Whether the underlying transport is still usable.
    ///
    /// Connections are torn down by the sweep once this returns `false`.
    fn is_available(&self) -> bool {
        true
    }
}

/// Upper-layer consumer of reassembled byte streams.
///
/// Invoked synchronously on a dispatch worker thread, outside every
/// transport lock. A decoder must not call back into the same connection's
/// receive path synchronously.
pub trait StreamDecoder: Send + Sync + 'static {
    /// Consume one reassembled, in-order chunk.
    fn decode(&self, bytes: Vec<u8>) -> Result<(), DecodeError>;
}

impl<F> StreamDecoder for F
where
    F: Fn(Vec<u8>) -> Result<(), DecodeError> + Send + Sync + 'static,
{
    fn decode(&self, bytes: Vec<u8>) -> Result<(), DecodeError> {
        self(bytes)
    }
}
