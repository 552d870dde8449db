//! Async UDP socket wrapper.
//!
//! [`UtpSocket`] owns the receive side of a tokio UDP socket; its
//! [`UdpSink`] queues outbound datagrams for a background send task and
//! implements [`DatagramSink`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::DatagramSink;
use crate::core::constants::MAX_DATAGRAM_SIZE;

/// Default receive buffer size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// Depth of the outbound datagram queue feeding the send task.
pub const SEND_QUEUE_DEPTH: usize = 1024;

/// Sending half of a [`UtpSocket`].
///
/// Datagrams go through a bounded queue to a background send task, so
/// `send_to` never blocks while a connection lock is held. A full queue
/// surfaces as `WouldBlock`; the packet stays in its send window and the
/// sweep retries it.
#[derive(Debug)]
pub struct UdpSink {
    send_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    available: AtomicBool,
}

impl UdpSink {
    /// Mark the socket unusable; the sweep closes every connection on it.
    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::Release);
    }
}

impl DatagramSink for UdpSink {
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        match self.send_tx.try_send((addr, datagram.to_vec())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "outbound datagram queue full",
            )),
            Err(TrySendError::Closed(_)) => {
                self.mark_unavailable();
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "send task stopped"))
            }
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

async fn run_send_task(
    socket: Arc<UdpSocket>,
    mut send_rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
) {
    while let Some((addr, datagram)) = send_rx.recv().await {
        // Lost datagrams are recovered by retransmission
        if let Err(e) = socket.send_to(&datagram, addr).await {
            tracing::debug!("Failed to send uTP datagram to {}: {}", addr, e);
        }
    }
}

/// Async UDP socket carrying uTP datagrams.
#[derive(Debug)]
pub struct UtpSocket {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    /// Shared sending half.
    sink: Arc<UdpSink>,
    /// Receive buffer.
    recv_buffer: Vec<u8>,
}

impl UtpSocket {
    /// Create a socket bound to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        UtpSocketBuilder::new().bind(addr).await
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Get the shared sending half.
    pub fn sink(&self) -> Arc<UdpSink> {
        Arc::clone(&self.sink)
    }

    /// Receive a datagram and return the sender's address.
    pub async fn recv_from(&mut self) -> io::Result<(&[u8], SocketAddr)> {
        let (len, addr) = self.socket.recv_from(&mut self.recv_buffer).await?;
        Ok((&self.recv_buffer[..len], addr))
    }
}

/// Builder for creating sockets with custom options.
#[derive(Debug, Clone)]
pub struct UtpSocketBuilder {
    recv_buffer_size: usize,
}

impl Default for UtpSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UtpSocketBuilder {
    /// Create a new socket builder with default options.
    pub fn new() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Set the receive buffer size (at least one full datagram).
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(MAX_DATAGRAM_SIZE);
        self
    }

    /// Bind to the given address and create a socket.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<UtpSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(self.from_socket(socket))
    }

    /// Create a socket from an existing UDP socket.
    ///
    /// Spawns the send task, so this must run inside a tokio runtime.
    pub fn from_socket(self, socket: UdpSocket) -> UtpSocket {
        let socket = Arc::new(socket);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        tokio::spawn(run_send_task(Arc::clone(&socket), send_rx));

        UtpSocket {
            socket,
            sink: Arc::new(UdpSink {
                send_tx,
                available: AtomicBool::new(true),
            }),
            recv_buffer: vec![0u8; self.recv_buffer_size],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = UtpSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() != 0);
        assert!(socket.sink().is_available());
    }

    #[tokio::test]
    async fn test_sink_send_recv() {
        let mut server = UtpSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UtpSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let data = b"hello uTP";
        client.sink().send_to(server_addr, data).unwrap();

        let (received, from) = server.recv_from().await.unwrap();
        assert_eq!(received, data);
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_mark_unavailable() {
        let socket = UtpSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let sink = socket.sink();
        sink.mark_unavailable();
        assert!(!socket.sink().is_available());
    }

    #[test]
    fn test_builder_keeps_one_datagram() {
        let builder = UtpSocketBuilder::new().recv_buffer_size(16);
        assert_eq!(builder.recv_buffer_size, MAX_DATAGRAM_SIZE);
    }
}
