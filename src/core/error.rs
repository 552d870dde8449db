//! Error types shared across the crate.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors reported by an upper-layer [`StreamDecoder`](super::StreamDecoder).
#[derive(Debug, Error, Clone)]
pub enum DecodeError {
    /// The reassembled bytes do not form a valid message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// More bytes are needed before a message can be decoded.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// The decoder has been shut down and accepts no more input.
    #[error("decoder closed")]
    Closed,
}

/// Top-level errors.
#[derive(Debug, Error)]
pub enum UtpError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Upper-layer decode error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Dispatch pool error.
    #[cfg(feature = "transport")]
    #[error("dispatch error: {0}")]
    Dispatch(#[from] crate::dispatch::DispatchError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
