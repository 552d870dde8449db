//! Protocol constants.
//!
//! Wire-level values are fixed by BEP 29 and MUST NOT be changed. Timing and
//! window values are defaults; most of them can be overridden through
//! [`UtpConfig`](crate::endpoint::UtpConfig).

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol version carried in the low nibble of the first header byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size (type/version, extension, connection id, timestamps,
/// window size, seq_nr, ack_nr).
pub const HEADER_SIZE: usize = 20;

/// Size of one extension header (next extension type + length).
pub const EXTENSION_HEADER_SIZE: usize = 2;

/// Link MTU the payload budget is derived from.
pub const LINK_MTU: usize = 1500;

/// IPv4 header overhead.
pub const IP_HEADER_SIZE: usize = 20;

/// UDP header overhead.
pub const UDP_HEADER_SIZE: usize = 8;

/// Maximum payload carried by a single packet (1452 bytes).
pub const MAX_PAYLOAD_SIZE: usize = LINK_MTU - IP_HEADER_SIZE - UDP_HEADER_SIZE - HEADER_SIZE;

/// Maximum encoded datagram size (header + payload).
pub const MAX_DATAGRAM_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

// =============================================================================
// PACKET TYPES
// =============================================================================

/// Regular data packet.
pub const ST_DATA: u8 = 0;

/// Graceful teardown.
pub const ST_FIN: u8 = 1;

/// Acknowledgment, no payload.
pub const ST_STATE: u8 = 2;

/// Forced teardown.
pub const ST_RESET: u8 = 3;

/// Connection initiation.
pub const ST_SYN: u8 = 4;

// =============================================================================
// WINDOW
// =============================================================================

/// Global window budget in bytes (1 MiB).
pub const WINDOW_BUDGET: usize = 1024 * 1024;

/// First sequence number handed out by a fresh send window.
///
/// An initiator's SYN consumes it; a responder's first DATA carries it.
pub const INITIAL_SEQ_NR: u16 = 1;

/// Starting and smallest congestion window, in packets.
pub const MIN_CONGESTION_WINDOW: usize = 16;

/// Largest congestion window, in packets.
pub const MAX_CONGESTION_WINDOW: usize = 64;

// =============================================================================
// TIMING
// =============================================================================

/// Lower bound of the retransmission timeout, in microseconds.
///
/// The estimate is clamped with `max(estimate, TIMEOUT_FLOOR_US)`, so this
/// acts as a floor. There is no upper cap.
pub const TIMEOUT_FLOOR_US: u32 = 500_000;

/// [`TIMEOUT_FLOOR_US`] as a [`Duration`].
pub const TIMEOUT_FLOOR: Duration = Duration::from_micros(TIMEOUT_FLOOR_US as u64);

/// Retransmissions allowed per packet before the connection is torn down.
pub const MAX_PUSH_TIMES: u32 = 3;

/// Consecutive unproductive acks tolerated before a fast retransmit.
pub const FAST_ACK_RETRY_TIMES: u32 = 3;

/// Period of the timeout sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// How long `connect` waits for the first STATE packet.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound silence after which the sweep closes a connection.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// DISPATCH
// =============================================================================

/// Default number of dispatch queues (one worker thread each).
pub const DISPATCH_QUEUE_COUNT: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_payload_matches_mtu() {
        assert_eq!(MAX_PAYLOAD_SIZE, 1452);
        assert_eq!(MAX_DATAGRAM_SIZE, 1472);
    }

    #[test]
    fn test_timeout_floor_is_500ms() {
        assert_eq!(TIMEOUT_FLOOR, Duration::from_millis(500));
    }
}
