//! # utp-transport
//!
//! A reliable, ordered byte-stream transport over UDP in the style of
//! BitTorrent's uTP (BEP 29). It provides:
//!
//! - **Reliability**: per-connection sliding windows with cumulative acks,
//!   timeout retransmission (Jacobson/Karels RTO, 500 ms floor) and fast
//!   retransmit on duplicate acks
//! - **Ordering**: out-of-order packets are buffered and delivered as
//!   contiguous chunks, across 16-bit sequence wrap
//! - **Decoupling**: reassembled bytes are decoded on a fixed pool of worker
//!   threads, never on the network receive path
//! - **Explicit ownership**: everything lives in a [`UtpEndpoint`]; there is
//!   no global state
//!
//! ## Feature Flags
//!
//! - `transport` (default): tokio UDP socket, connections, registry, sweep,
//!   dispatch pool and endpoint
//!
//! Without `transport` only the pure data layer is built: the packet codec,
//! sequence arithmetic, RTO estimator and [`ConnectionState`].
//!
//! ## Modules
//!
//! - [`core`]: constants, collaborator traits and error types
//! - [`transport`]: packet codec, windows, connections, socket
//! - [`registry`]: connection registry and timeout sweep
//! - [`dispatch`]: round-robin decode worker pool
//! - [`endpoint`]: configuration and the top-level endpoint
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use utp_transport::prelude::*;
//!
//! # async fn run() -> Result<(), UtpError> {
//! let config = UtpConfigBuilder::new()
//!     .bind_addr("127.0.0.1:0".parse().unwrap())
//!     .build()?;
//!
//! let (endpoint, mut events) = UtpEndpoint::bind(config, |key: ConnectionKey| {
//!     let decoder: Arc<dyn StreamDecoder> = Arc::new(move |bytes: Vec<u8>| {
//!         println!("{key}: {} bytes", bytes.len());
//!         Ok::<(), DecodeError>(())
//!     });
//!     decoder
//! })
//! .await?;
//!
//! let peer = endpoint.connect("127.0.0.1:6881".parse().unwrap()).await?;
//! peer.send(b"hello")?;
//!
//! while let Some(event) = events.recv().await {
//!     if let TransportEvent::Closed { key, reason } = event {
//!         println!("{key} closed: {reason}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Packet codec and windows are always built; sockets and connections are
// gated inside the module.
pub mod transport;

// Decode worker pool (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod dispatch;

// Connection registry and sweep (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod registry;

// Endpoint API (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod endpoint;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::transport::{
        ConnectionKey, ConnectionState, ConnectionStats, Header, PacketError, PacketRecord,
        PacketType, RtoEstimator, TransportError, TransportResult,
    };

    #[cfg(feature = "transport")]
    pub use crate::dispatch::{DecodeRequest, DispatchPool, QueueHandle};

    #[cfg(feature = "transport")]
    pub use crate::endpoint::{ConnectionHandle, UtpConfig, UtpConfigBuilder, UtpEndpoint};

    #[cfg(feature = "transport")]
    pub use crate::registry::{ConnectionRegistry, TransportEvent};

    #[cfg(feature = "transport")]
    pub use crate::transport::{CloseReason, Connection, ConnectionPhase};
}

// Re-export commonly used items at crate root
pub use core::{DatagramSink, DecodeError, StreamDecoder, UtpError};
pub use transport::{ConnectionKey, ConnectionState, PacketRecord, TransportError};

#[cfg(feature = "transport")]
pub use endpoint::{ConnectionHandle, UtpConfig, UtpConfigBuilder, UtpEndpoint};

#[cfg(feature = "transport")]
pub use registry::TransportEvent;
