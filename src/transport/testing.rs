//! Test doubles shared by the transport, registry and endpoint tests.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::core::DatagramSink;

use super::packet::{Header, decode};

/// Sink that records every datagram instead of sending it.
#[derive(Debug)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    available: AtomicBool,
    failing: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }

    /// Drain and parse everything sent so far.
    pub(crate) fn take(&self) -> Vec<(Header, Vec<u8>)> {
        self.sent
            .lock()
            .drain(..)
            .map(|(_, datagram)| {
                let (header, payload) = decode(&datagram).unwrap();
                (header, payload.to_vec())
            })
            .collect()
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

impl DatagramSink for RecordingSink {
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.sent.lock().push((addr, datagram.to_vec()));
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

pub(crate) fn peer_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881)
}
