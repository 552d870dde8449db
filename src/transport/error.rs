//! Transport layer error types.
//!
//! Per-packet problems (bad headers, stale or unknown connections) are
//! dropped silently; only connection-level failures reach the caller.

use std::net::SocketAddr;

use thiserror::Error;

use super::packet::PacketError;
use super::window::ConnectionKey;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Packet parsing error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Packet for a connection that has already been torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// RESET for a connection this endpoint never had.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionKey),

    /// Peer did not answer the SYN within the connect timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// Data sent before the handshake completed.
    #[error("connection not established")]
    NotEstablished,

    /// The congestion window has no room for the packets needed.
    #[error("congestion window full: {requested} packets requested, {available} available")]
    CongestionWindowFull {
        /// Packets the payload would take.
        requested: usize,
        /// Packets the congestion window still admits.
        available: usize,
    },

    /// Send window budget exhausted.
    #[error("send window full: {requested} bytes requested, {available} available")]
    WindowFull {
        /// Bytes the caller tried to enqueue.
        requested: usize,
        /// Remaining window capacity.
        available: usize,
    },

    /// A packet was retransmitted too many times without acknowledgment.
    #[error("max retransmits exceeded")]
    MaxRetransmitsExceeded,

    /// The socket layer reported the transport unavailable.
    #[error("transport unavailable")]
    Unavailable,

    /// Every candidate connection id to this peer is taken.
    #[error("no free connection id for {0}")]
    NoConnectionId(SocketAddr),
}

impl TransportError {
    /// Check if this error should result in a silent drop (no response sent).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransportError::Packet(_)
                | TransportError::ConnectionClosed
                | TransportError::UnknownConnection(_)
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_silent_drop_errors() {
        let key = ConnectionKey::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1), 2);
        assert!(TransportError::Packet(PacketError::InvalidType(9)).is_silent_drop());
        assert!(TransportError::ConnectionClosed.is_silent_drop());
        assert!(TransportError::UnknownConnection(key).is_silent_drop());

        assert!(!TransportError::ConnectTimeout.is_silent_drop());
        assert!(!TransportError::MaxRetransmitsExceeded.is_silent_drop());
        assert!(!TransportError::Unavailable.is_silent_drop());
    }

    #[test]
    fn test_window_errors_display() {
        let full = TransportError::WindowFull {
            requested: 10,
            available: 0,
        };
        assert_eq!(
            full.to_string(),
            "send window full: 10 bytes requested, 0 available"
        );
        let congested = TransportError::CongestionWindowFull {
            requested: 3,
            available: 1,
        };
        assert_eq!(
            congested.to_string(),
            "congestion window full: 3 packets requested, 1 available"
        );
    }
}
