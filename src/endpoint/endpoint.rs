//! The uTP endpoint.
//!
//! Inbound path: datagram → header decode → registry lookup or creation →
//! [`Connection::on_packet`] → teardown through the registry when the
//! packet asks for it. Outbound connections are registered under a freshly
//! allocated `recv_id` and wait on a oneshot for the handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::{DatagramSink, StreamDecoder, UtpError};
use crate::dispatch::DispatchPool;
use crate::registry::{ConnectionRegistry, SweepDriver, SweepReport, TransportEvent, sweep_once};
use crate::transport::{
    CloseReason, Connection, ConnectionContext, ConnectionKey, ConnectionStats, PacketType,
    TransportError, TransportResult, UtpSocket, UtpSocketBuilder, decode, timestamp_us,
};

use super::config::UtpConfig;

/// Connection ids tried before `connect` gives up on a busy peer.
const CONNECT_ID_ATTEMPTS: usize = 16;

type DecoderFactory = dyn Fn(ConnectionKey) -> Arc<dyn StreamDecoder> + Send + Sync;

struct Shared {
    config: UtpConfig,
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn DatagramSink>,
    pool: Arc<DispatchPool>,
    decoders: Box<DecoderFactory>,
}

impl Shared {
    fn context(&self, key: ConnectionKey) -> ConnectionContext {
        ConnectionContext {
            sink: Arc::clone(&self.sink),
            pool: Arc::clone(&self.pool),
            decoder: (self.decoders)(key),
            config: self.config.connection_config(),
        }
    }

    fn on_datagram(&self, addr: SocketAddr, datagram: &[u8]) -> TransportResult<()> {
        let (header, payload) = decode(datagram)?;

        let conn = if header.packet_type == PacketType::Syn {
            let key = ConnectionKey::new(addr, header.connection_id.wrapping_add(1));
            let (conn, created) = self.registry.get_or_create(key, || {
                Connection::accepting(addr, header.connection_id, self.context(key))
            });
            if created {
                self.registry.forget_closed(&key);
                self.registry.notify(TransportEvent::Accepted { key });
            }
            conn
        } else {
            let key = ConnectionKey::new(addr, header.connection_id);
            match self.registry.get(&key) {
                Some(conn) => conn,
                None if self.registry.was_closed(&key) => {
                    return Err(TransportError::ConnectionClosed);
                }
                None if header.packet_type == PacketType::Reset => {
                    return Err(TransportError::UnknownConnection(key));
                }
                None => {
                    let (conn, created) = self.registry.get_or_create(key, || {
                        Connection::implicit(key, &header, self.context(key))
                    });
                    if created {
                        self.registry.notify(TransportEvent::Accepted { key });
                    }
                    conn
                }
            }
        };

        if let Some(reason) = conn.on_packet(&header, payload) {
            self.registry.close(&conn, reason);
        }
        Ok(())
    }
}

/// Handle to one connection of an endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionHandle {
    /// Registry key.
    pub fn key(&self) -> ConnectionKey {
        self.conn.key()
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.key().remote_addr
    }

    /// Send bytes; see [`Connection::send`].
    pub fn send(&self, data: &[u8]) -> TransportResult<usize> {
        self.conn.send(data)
    }

    /// Send FIN and tear the connection down.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        if self.conn.is_closed() {
            return false;
        }
        self.conn.send_fin();
        self.registry.close(&self.conn, CloseReason::Local)
    }

    /// Send RESET and tear the connection down.
    pub fn reset(&self) -> bool {
        if self.conn.is_closed() {
            return false;
        }
        self.conn.send_reset();
        self.registry.close(&self.conn, CloseReason::Local)
    }

    /// Counters.
    pub fn stats(&self) -> ConnectionStats {
        self.conn.stats()
    }

    /// `true` while the connection can carry data.
    pub fn is_established(&self) -> bool {
        self.conn.is_established()
    }

    /// `true` once torn down.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Bytes that can still be sent before the window is full.
    pub fn remaining_capacity(&self) -> usize {
        self.conn.remaining_capacity()
    }

    /// Bytes sent but not yet acknowledged.
    pub fn in_flight_bytes(&self) -> usize {
        self.conn.in_flight_bytes()
    }

    /// See [`Connection::congestion_gated`].
    pub fn congestion_gated(&self) -> bool {
        self.conn.congestion_gated()
    }
}

/// A uTP endpoint: one socket, many connections.
///
/// Owns the registry, the sweep driver, the dispatch pool and (when bound
/// to a socket) the receive loop.
pub struct UtpEndpoint {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    sweep: Option<SweepDriver>,
    recv_shutdown: Option<oneshot::Sender<()>>,
    recv_task: Option<JoinHandle<()>>,
}

impl UtpEndpoint {
    /// Bind a UDP socket and start the receive loop and sweep.
    ///
    /// `decoders` is called once per new connection to create the consumer
    /// of its reassembled bytes.
    pub async fn bind<F>(
        config: UtpConfig,
        decoders: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), UtpError>
    where
        F: Fn(ConnectionKey) -> Arc<dyn StreamDecoder> + Send + Sync + 'static,
    {
        config.validate()?;
        let socket = UtpSocketBuilder::new()
            .recv_buffer_size(config.recv_buffer_size)
            .bind(config.bind_addr)
            .await?;
        let local_addr = socket.local_addr()?;
        let sink: Arc<dyn DatagramSink> = socket.sink();

        let (mut endpoint, events) = Self::with_sink(config, sink, decoders)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        endpoint.recv_task = Some(tokio::spawn(run_recv_loop(
            socket,
            Arc::clone(&endpoint.shared),
            shutdown_rx,
        )));
        endpoint.recv_shutdown = Some(shutdown_tx);
        endpoint.local_addr = Some(local_addr);

        tracing::debug!("uTP endpoint bound to {}", local_addr);
        Ok((endpoint, events))
    }

    /// Build an endpoint over a caller-supplied sink.
    ///
    /// No receive loop runs; inbound datagrams are fed through
    /// [`on_datagram`](Self::on_datagram). Must be called inside a tokio
    /// runtime (the sweep driver is spawned).
    pub fn with_sink<F>(
        config: UtpConfig,
        sink: Arc<dyn DatagramSink>,
        decoders: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), UtpError>
    where
        F: Fn(ConnectionKey) -> Arc<dyn StreamDecoder> + Send + Sync + 'static,
    {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(event_tx));
        let pool = Arc::new(DispatchPool::new(config.dispatch_queues)?);
        let sweep = SweepDriver::spawn(
            Arc::clone(&registry),
            config.sweep_interval,
            config.idle_timeout,
        );

        let shared = Arc::new(Shared {
            config,
            registry,
            sink,
            pool,
            decoders: Box::new(decoders),
        });

        Ok((
            Self {
                shared,
                local_addr: None,
                sweep: Some(sweep),
                recv_shutdown: None,
                recv_task: None,
            },
            event_rx,
        ))
    }

    /// Feed one inbound datagram.
    ///
    /// Malformed datagrams, packets for closed connections and RESETs for
    /// unknown ones are dropped with an error that
    /// [`is_silent_drop`](TransportError::is_silent_drop); nothing is sent
    /// back for them.
    pub fn on_datagram(&self, addr: SocketAddr, datagram: &[u8]) -> TransportResult<()> {
        self.shared.on_datagram(addr, datagram)
    }

    /// Open a connection and wait for the handshake.
    ///
    /// Fails with [`TransportError::ConnectTimeout`] if no STATE arrives
    /// within the configured connect timeout; the half-open connection is
    /// reset and deregistered.
    pub async fn connect(&self, addr: SocketAddr) -> TransportResult<ConnectionHandle> {
        let registry = &self.shared.registry;
        let conn = self.register_outbound(addr)?;
        let established = match conn.connect() {
            Ok(rx) => rx,
            Err(e) => {
                registry.close(&conn, CloseReason::ConnectFailed);
                return Err(e);
            }
        };

        match tokio::time::timeout(self.shared.config.connect_timeout, established).await {
            Ok(Ok(())) => Ok(self.wrap(conn)),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("Connect to {} timed out", addr);
                conn.send_reset();
                registry.close(&conn, CloseReason::ConnectFailed);
                Err(TransportError::ConnectTimeout)
            }
        }
    }

    fn register_outbound(&self, addr: SocketAddr) -> TransportResult<Arc<Connection>> {
        let registry = &self.shared.registry;
        for _ in 0..CONNECT_ID_ATTEMPTS {
            let key = ConnectionKey::new(addr, registry.next_connection_id());
            let conn = Arc::new(Connection::outbound(key, self.shared.context(key)));
            if registry.insert(Arc::clone(&conn)) {
                registry.forget_closed(&key);
                return Ok(conn);
            }
        }
        Err(TransportError::NoConnectionId(addr))
    }

    fn wrap(&self, conn: Arc<Connection>) -> ConnectionHandle {
        ConnectionHandle {
            conn,
            registry: Arc::clone(&self.shared.registry),
        }
    }

    /// Handle for a registered connection (e.g. after
    /// [`TransportEvent::Accepted`]).
    pub fn handle(&self, key: &ConnectionKey) -> Option<ConnectionHandle> {
        self.shared.registry.get(key).map(|conn| self.wrap(conn))
    }

    /// Send bytes on a connection.
    pub fn send(&self, handle: &ConnectionHandle, data: &[u8]) -> TransportResult<usize> {
        handle.send(data)
    }

    /// Close a connection with FIN.
    pub fn close(&self, handle: &ConnectionHandle) -> bool {
        handle.close()
    }

    /// Run one sweep pass now, in addition to the periodic ones.
    pub fn sweep_now(&self) -> SweepReport {
        sweep_once(
            &self.shared.registry,
            timestamp_us(),
            Instant::now(),
            self.shared.config.idle_timeout,
        )
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Local socket address, if bound to a socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Configuration in use.
    pub fn config(&self) -> &UtpConfig {
        &self.shared.config
    }

    /// Stop the receive loop and sweep, close every connection with FIN and
    /// join the dispatch workers.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.recv_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.recv_task.take() {
            let _ = task.await;
        }
        if let Some(sweep) = self.sweep.take() {
            sweep.shutdown().await;
        }

        for conn in self.shared.registry.snapshot() {
            conn.send_fin();
        }
        let closed = self.shared.registry.close_all(CloseReason::Shutdown);

        let pool = Arc::clone(&self.shared.pool);
        let _ = tokio::task::spawn_blocking(move || pool.shutdown()).await;
        tracing::debug!("uTP endpoint shut down ({} connections closed)", closed);
    }
}

impl std::fmt::Debug for UtpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpEndpoint")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.shared.registry.len())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Drop for UtpEndpoint {
    fn drop(&mut self) {
        if let Some(tx) = self.recv_shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn run_recv_loop(
    mut socket: UtpSocket,
    shared: Arc<Shared>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let sink = socket.sink();
    loop {
        tokio::select! {
            result = socket.recv_from() => match result {
                Ok((datagram, addr)) => match shared.on_datagram(addr, datagram) {
                    Ok(()) => {}
                    Err(e) if e.is_silent_drop() => {
                        tracing::debug!("Dropping datagram from {}: {}", addr, e);
                    }
                    Err(e) => tracing::warn!("Failed to handle datagram from {}: {}", addr, e),
                },
                // ICMP port unreachable on some platforms; not fatal
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    tracing::debug!("Ignoring receive error: {}", e);
                }
                Err(e) => {
                    tracing::warn!("uTP receive loop failed: {}", e);
                    sink.mark_unavailable();
                    break;
                }
            },
            _ = &mut shutdown_rx => break,
        }
    }
    tracing::debug!("uTP receive loop stopped");
}
