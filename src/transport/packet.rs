//! Packet header codec and packet records.
//!
//! Header wire format (20 bytes, big-endian, BEP 29):
//!
//! ```text
//! 0       4       8               16              24              32
//! +-------+-------+---------------+---------------+---------------+
//! | type  | ver   | extension     | connection_id                 |
//! +-------+-------+---------------+---------------+---------------+
//! | timestamp_microseconds                                        |
//! +---------------+---------------+---------------+---------------+
//! | timestamp_difference_microseconds                             |
//! +---------------+---------------+---------------+---------------+
//! | wnd_size                                                      |
//! +---------------+---------------+---------------+---------------+
//! | seq_nr                        | ack_nr                        |
//! +---------------+---------------+---------------+---------------+
//! ```
//!
//! A non-zero extension byte is followed by a chain of
//! `(next_extension: u8, len: u8, data[len])` entries. Extensions are
//! skipped on decode and never emitted.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::core::constants::{
    EXTENSION_HEADER_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, ST_DATA, ST_FIN,
    ST_RESET, ST_STATE, ST_SYN,
};

/// Packet type, carried in the high nibble of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Regular data packet.
    Data = ST_DATA,
    /// Graceful teardown.
    Fin = ST_FIN,
    /// Acknowledgment (no payload).
    State = ST_STATE,
    /// Forced teardown.
    Reset = ST_RESET,
    /// Connection initiation.
    Syn = ST_SYN,
}

impl PacketType {
    /// Parse a packet type from its 4-bit value.
    pub fn from_nibble(value: u8) -> Option<Self> {
        match value {
            ST_DATA => Some(Self::Data),
            ST_FIN => Some(Self::Fin),
            ST_STATE => Some(Self::State),
            ST_RESET => Some(Self::Reset),
            ST_SYN => Some(Self::Syn),
            _ => None,
        }
    }

    /// The 4-bit wire value.
    pub fn as_nibble(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "ST_DATA"),
            Self::Fin => write!(f, "ST_FIN"),
            Self::State => write!(f, "ST_STATE"),
            Self::Reset => write!(f, "ST_RESET"),
            Self::Syn => write!(f, "ST_SYN"),
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Packet type.
    pub packet_type: PacketType,
    /// Connection id (the receiver's `recv_id`, or the initiator's id on SYN).
    pub connection_id: u16,
    /// Sender clock at transmission, microseconds (wrapping).
    pub timestamp: u32,
    /// Sender's measured one-way delay, informational.
    pub timestamp_difference: u32,
    /// Sender's advertised receive window in bytes.
    pub window_size: u32,
    /// Sequence number.
    pub seq_nr: u16,
    /// Cumulative acknowledgment number.
    pub ack_nr: u16,
}

impl Header {
    /// Create a header with zeroed timing and window fields.
    pub fn new(packet_type: PacketType, connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self {
            packet_type,
            connection_id,
            timestamp: 0,
            timestamp_difference: 0,
            window_size: 0,
            seq_nr,
            ack_nr,
        }
    }

    /// Set the timestamp fields.
    pub fn with_timestamps(mut self, timestamp: u32, timestamp_difference: u32) -> Self {
        self.timestamp = timestamp;
        self.timestamp_difference = timestamp_difference;
        self
    }

    /// Set the advertised window.
    pub fn with_window(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    /// Serialize the header (20 bytes).
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = (self.packet_type.as_nibble() << 4) | PROTOCOL_VERSION;
        buf[1] = 0;
        buf[2..4].copy_from_slice(&self.connection_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.timestamp_difference.to_be_bytes());
        buf[12..16].copy_from_slice(&self.window_size.to_be_bytes());
        buf[16..18].copy_from_slice(&self.seq_nr.to_be_bytes());
        buf[18..20].copy_from_slice(&self.ack_nr.to_be_bytes());
        buf
    }

    /// Parse the fixed header. Extensions and payload are not inspected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let version = bytes[0] & 0x0F;
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let packet_type =
            PacketType::from_nibble(bytes[0] >> 4).ok_or(PacketError::InvalidType(bytes[0] >> 4))?;

        Ok(Self {
            packet_type,
            connection_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            timestamp_difference: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            window_size: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            seq_nr: u16::from_be_bytes([bytes[16], bytes[17]]),
            ack_nr: u16::from_be_bytes([bytes[18], bytes[19]]),
        })
    }
}

/// Errors that can occur while decoding a datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than the fixed header.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Unknown packet type nibble.
    #[error("invalid packet type: {0}")]
    InvalidType(u8),

    /// Version nibble other than [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Extension chain runs past the end of the datagram.
    #[error("extension length {declared} exceeds remaining {remaining} bytes")]
    ExtensionOverrun {
        /// Length declared by the extension header.
        declared: usize,
        /// Bytes left in the datagram.
        remaining: usize,
    },

    /// Payload larger than one packet may carry.
    #[error("payload too large: {0} bytes (max {max})", max = MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),
}

/// Encode a header and payload into one datagram.
pub fn encode(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a datagram into its header and payload, skipping extensions.
pub fn decode(bytes: &[u8]) -> Result<(Header, &[u8]), PacketError> {
    let header = Header::from_bytes(bytes)?;

    let mut next_extension = bytes[1];
    let mut offset = HEADER_SIZE;
    while next_extension != 0 {
        let remaining = bytes.len() - offset;
        if remaining < EXTENSION_HEADER_SIZE {
            return Err(PacketError::ExtensionOverrun {
                declared: EXTENSION_HEADER_SIZE,
                remaining,
            });
        }
        next_extension = bytes[offset];
        let len = bytes[offset + 1] as usize;
        offset += EXTENSION_HEADER_SIZE;
        if bytes.len() - offset < len {
            return Err(PacketError::ExtensionOverrun {
                declared: len,
                remaining: bytes.len() - offset,
            });
        }
        offset += len;
    }

    let payload = &bytes[offset..];
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }
    Ok((header, payload))
}

/// Current wall clock in microseconds, truncated to 32 bits.
pub fn timestamp_us() -> u32 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (duration.as_micros() & 0xFFFF_FFFF) as u32
}

/// One unit of outbound or inbound data.
///
/// Outbound records live in a send window until acknowledged; inbound
/// records live in a receive window until drained into a reassembled chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    /// Sequence number.
    pub seq: u16,
    /// Most recent (re)send time, or arrival time for inbound records.
    pub timestamp: u32,
    /// Payload; empty for control packets.
    pub payload: Vec<u8>,
    /// Retransmissions so far (send side only).
    pub retry_count: u32,
}

impl PacketRecord {
    /// Create a record that has not been retransmitted.
    pub fn new(seq: u16, timestamp: u32, payload: Vec<u8>) -> Self {
        Self {
            seq,
            timestamp,
            payload,
            retry_count: 0,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// `true` for control packets (SYN, keepalive).
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Age of the record relative to `now`, in microseconds (wrapping).
    pub fn age(&self, now: u32) -> u32 {
        now.wrapping_sub(self.timestamp)
    }
}
