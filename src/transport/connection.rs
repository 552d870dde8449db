//! Connection: a sliding window behind a lock, wired to its collaborators.
//!
//! A [`Connection`] owns one [`ConnectionState`] guarded by a
//! `parking_lot::Mutex`. Every operation that touches the window (sending,
//! acknowledgment processing, reassembly and the retransmission scan) takes
//! that lock, so they are mutually exclusive per connection. Datagrams are
//! handed to a non-blocking [`DatagramSink`] while the lock is held;
//! reassembled bytes are queued on the [`DispatchPool`] and decoded on a
//! worker thread outside every transport lock.
//!
//! Handshake, from the initiator's point of view:
//!
//! ```text
//! initiator                                 responder
//!   recv_id = alloc, send_id = recv_id + 1
//!   SYN(conn_id = recv_id, seq = 1)  ──────▶ key (addr, conn_id + 1)
//!                                             send_id = conn_id
//!   cursor = state.seq - 1          ◀──────  STATE(ack = 1)
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::core::constants::{
    FAST_ACK_RETRY_TIMES, INITIAL_SEQ_NR, MAX_PAYLOAD_SIZE, MAX_PUSH_TIMES, WINDOW_BUDGET,
};
use crate::core::{DatagramSink, StreamDecoder};
use crate::dispatch::{DecodeRequest, DispatchPool};

use super::error::{TransportError, TransportResult};
use super::packet::{Header, PacketType, encode, timestamp_us};
use super::window::{ConnectionKey, ConnectionState, ConnectionStats};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// SYN sent, waiting for the first STATE.
    SynSent,
    /// Created for an inbound SYN that has not been answered yet.
    SynRecv,
    /// Handshake complete, data may flow.
    Connected,
    /// Torn down; every further packet is dropped.
    Closed,
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local application.
    Local,
    /// The peer sent FIN.
    PeerFin,
    /// The peer sent RESET.
    PeerReset,
    /// A packet went unacknowledged past the retry cap.
    RetriesExhausted,
    /// The socket layer reported the transport unavailable.
    Unavailable,
    /// No inbound traffic for the idle timeout.
    Idle,
    /// The handshake did not complete within the connect timeout.
    ConnectFailed,
    /// The endpoint is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Local => "closed locally",
            Self::PeerFin => "peer sent FIN",
            Self::PeerReset => "peer sent RESET",
            Self::RetriesExhausted => "retries exhausted",
            Self::Unavailable => "transport unavailable",
            Self::Idle => "idle timeout",
            Self::ConnectFailed => "connect failed",
            Self::Shutdown => "endpoint shutdown",
        };
        f.write_str(reason)
    }
}

/// Per-connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Send window budget in bytes.
    pub window_budget: usize,
    /// Largest payload per DATA packet.
    pub max_payload: usize,
    /// Retransmissions allowed per record before teardown.
    pub max_push_times: u32,
    /// Consecutive unproductive acks tolerated before a fast retransmit.
    pub fast_ack_retry_times: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            window_budget: WINDOW_BUDGET,
            max_payload: MAX_PAYLOAD_SIZE,
            max_push_times: MAX_PUSH_TIMES,
            fast_ack_retry_times: FAST_ACK_RETRY_TIMES,
        }
    }
}

/// Collaborators shared by every connection of an endpoint.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Datagram output.
    pub sink: Arc<dyn DatagramSink>,
    /// Where reassembled bytes are queued.
    pub pool: Arc<DispatchPool>,
    /// Consumer of reassembled bytes.
    pub decoder: Arc<dyn StreamDecoder>,
    /// Tunables.
    pub config: ConnectionConfig,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("pool_size", &self.pool.size())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Inner {
    state: ConnectionState,
    phase: ConnectionPhase,
    /// Sequence number our SYN consumed, if we initiated.
    syn_seq: Option<u16>,
    /// Last measured one-way delay, echoed in `timestamp_difference`.
    reply_micro: u32,
    last_received: Instant,
    established: Option<oneshot::Sender<()>>,
}

/// One uTP connection.
pub struct Connection {
    key: ConnectionKey,
    send_id: u16,
    inner: Mutex<Inner>,
    closed: AtomicBool,
    ctx: ConnectionContext,
}

impl Connection {
    fn with_phase(
        key: ConnectionKey,
        send_id: u16,
        phase: ConnectionPhase,
        ctx: ConnectionContext,
    ) -> Self {
        Self {
            key,
            send_id,
            inner: Mutex::new(Inner {
                state: ConnectionState::with_budget(key, ctx.config.window_budget),
                phase,
                syn_seq: None,
                reply_micro: 0,
                last_received: Instant::now(),
                established: None,
            }),
            closed: AtomicBool::new(false),
            ctx,
        }
    }

    /// Initiating side; `key.conn_id` is the locally allocated `recv_id`.
    pub fn outbound(key: ConnectionKey, ctx: ConnectionContext) -> Self {
        Self::with_phase(
            key,
            key.conn_id.wrapping_add(1),
            ConnectionPhase::SynSent,
            ctx,
        )
    }

    /// Responding side for a SYN carrying `syn_conn_id`.
    pub fn accepting(remote_addr: SocketAddr, syn_conn_id: u16, ctx: ConnectionContext) -> Self {
        let key = ConnectionKey::new(remote_addr, syn_conn_id.wrapping_add(1));
        Self::with_phase(key, syn_conn_id, ConnectionPhase::SynRecv, ctx)
    }

    /// State for a non-SYN packet on an unknown id, treated as established.
    ///
    /// The receive cursor sits on the SYN the peer is assumed to have sent
    /// (`INITIAL_SEQ_NR`), independent of which packet shows up first, so
    /// reordered early packets are still reassembled.
    pub fn implicit(key: ConnectionKey, header: &Header, ctx: ConnectionContext) -> Self {
        let conn = Self::with_phase(
            key,
            key.conn_id.wrapping_sub(1),
            ConnectionPhase::Connected,
            ctx,
        );
        conn.inner
            .lock()
            .state
            .connect(header.timestamp, INITIAL_SEQ_NR);
        conn
    }

    /// Send the SYN and return a receiver resolved once established.
    ///
    /// The SYN consumes a sequence number and stays in the send window, so
    /// the sweep retransmits it like data.
    pub fn connect(&self) -> TransportResult<oneshot::Receiver<()>> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut inner = self.inner.lock();
        if inner.phase != ConnectionPhase::SynSent || inner.syn_seq.is_some() {
            return Err(TransportError::NotEstablished);
        }

        let now = timestamp_us();
        let record = inner.state.enqueue_at(None, now);
        inner.syn_seq = Some(record.seq);
        let (tx, rx) = oneshot::channel();
        inner.established = Some(tx);

        tracing::debug!("Connecting {} (send_id {})", self.key, self.send_id);
        self.transmit(&mut inner, PacketType::Syn, record.seq, &[], now);
        Ok(rx)
    }

    /// Send application bytes, split into `max_payload` packets.
    ///
    /// Returns the number of packets queued. The whole payload is refused
    /// if it does not fit in the remaining byte window or needs more
    /// packets than the congestion window has room for.
    pub fn send(&self, data: &[u8]) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.ctx.sink.is_available() {
            return Err(TransportError::Unavailable);
        }

        let mut inner = self.inner.lock();
        if inner.phase != ConnectionPhase::Connected {
            return Err(TransportError::NotEstablished);
        }
        let available = inner.state.remaining_capacity();
        if data.len() > available {
            return Err(TransportError::WindowFull {
                requested: data.len(),
                available,
            });
        }

        let max_payload = self.ctx.config.max_payload.max(1);
        let needed = data.len().div_ceil(max_payload);
        let room = inner.state.packet_capacity();
        if needed > room {
            return Err(TransportError::CongestionWindowFull {
                requested: needed,
                available: room,
            });
        }

        let now = timestamp_us();
        let mut packets = 0;
        for chunk in data.chunks(max_payload) {
            let record = inner.state.enqueue_at(Some(chunk.to_vec()), now);
            self.transmit(&mut inner, PacketType::Data, record.seq, &record.payload, now);
            packets += 1;
        }
        Ok(packets)
    }

    /// Process one inbound packet.
    ///
    /// Returns a reason when the packet requires teardown; the caller
    /// closes the connection through the registry. FIN and RESET tear down
    /// at once, so out-of-order data still buffered behind a gap is lost.
    pub fn on_packet(&self, header: &Header, payload: &[u8]) -> Option<CloseReason> {
        if self.is_closed() {
            tracing::debug!(
                "Dropping {} seq {} for closed connection {}",
                header.packet_type,
                header.seq_nr,
                self.key
            );
            return None;
        }

        let now = timestamp_us();
        let mut inner = self.inner.lock();
        inner.last_received = Instant::now();
        inner.reply_micro = now.wrapping_sub(header.timestamp);
        inner.state.stats_mut().packets_received += 1;

        match header.packet_type {
            PacketType::Syn => {
                self.on_syn(&mut inner, header, now);
                None
            }
            PacketType::State => {
                self.on_state(&mut inner, header, now);
                None
            }
            PacketType::Data => {
                self.on_data(&mut inner, header, payload, now);
                None
            }
            PacketType::Fin | PacketType::Reset => {
                if inner.phase == ConnectionPhase::Connected {
                    self.send_state(&mut inner, now);
                }
                tracing::debug!("{} received on {}", header.packet_type, self.key);
                Some(if header.packet_type == PacketType::Fin {
                    CloseReason::PeerFin
                } else {
                    CloseReason::PeerReset
                })
            }
        }
    }

    fn on_syn(&self, inner: &mut Inner, header: &Header, now: u32) {
        if inner.phase == ConnectionPhase::SynRecv {
            inner.state.connect(header.timestamp, header.seq_nr);
            inner.phase = ConnectionPhase::Connected;
            tracing::debug!("Accepted {} (send_id {})", self.key, self.send_id);
        }
        // Duplicate SYNs are answered again; the first STATE may have been lost
        self.send_state(inner, now);
    }

    fn on_state(&self, inner: &mut Inner, header: &Header, now: u32) {
        if inner.phase == ConnectionPhase::SynSent {
            inner
                .state
                .connect(header.timestamp, header.seq_nr.wrapping_sub(1));
            self.establish(inner);
        }

        let outcome = inner.state.on_ack_at(header.ack_nr, header.window_size, now);
        if outcome.unproductive_acks > self.ctx.config.fast_ack_retry_times {
            if let Some(record) = inner.state.take_fast_retransmit(header.ack_nr, now) {
                tracing::debug!(
                    "Fast retransmit of seq {} on {} after {} duplicate acks",
                    record.seq,
                    self.key,
                    outcome.unproductive_acks
                );
                let packet_type = Self::record_type(inner, record.seq);
                self.transmit(inner, packet_type, record.seq, &record.payload, now);
            }
        }
    }

    fn on_data(&self, inner: &mut Inner, header: &Header, payload: &[u8], now: u32) {
        if inner.phase == ConnectionPhase::SynSent {
            // STATE was lost, but data from the peer proves the handshake.
            // The responder numbers its first DATA with INITIAL_SEQ_NR.
            inner
                .state
                .connect(header.timestamp, INITIAL_SEQ_NR.wrapping_sub(1));
            self.establish(inner);
        }

        if let Some(bytes) = inner
            .state
            .receive(header.timestamp, header.seq_nr, payload.to_vec())
        {
            self.deliver(bytes);
        }
        self.send_state(inner, now);
    }

    fn establish(&self, inner: &mut Inner) {
        inner.phase = ConnectionPhase::Connected;
        if let Some(tx) = inner.established.take() {
            let _ = tx.send(());
        }
        tracing::debug!("Connected {}", self.key);
    }

    fn deliver(&self, bytes: Vec<u8>) {
        let len = bytes.len();
        let request =
            DecodeRequest::new(bytes, Arc::clone(&self.ctx.decoder)).with_origin(self.key);
        if let Err(e) = self.ctx.pool.acquire_queue().submit(request) {
            tracing::warn!("Dropping {} reassembled bytes on {}: {}", len, self.key, e);
        }
    }

    /// Retransmit every overdue record.
    ///
    /// Fails with [`TransportError::MaxRetransmitsExceeded`] once a record
    /// passes the retry cap; nothing is resent in that case.
    pub fn retransmit_overdue(&self, now: u32) -> TransportResult<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        let scan = inner
            .state
            .retransmit_overdue_at(now, self.ctx.config.max_push_times);
        if scan.exhausted {
            return Err(TransportError::MaxRetransmitsExceeded);
        }

        for record in &scan.resend {
            let packet_type = Self::record_type(&inner, record.seq);
            self.transmit(&mut inner, packet_type, record.seq, &record.payload, now);
        }
        Ok(scan.resend.len())
    }

    /// Send FIN if established. FIN carries the next sequence number but is
    /// not tracked for retransmission.
    pub fn send_fin(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == ConnectionPhase::Connected {
            let seq = inner.state.next_seq();
            self.transmit(&mut inner, PacketType::Fin, seq, &[], timestamp_us());
        }
    }

    /// Send RESET unless already closed.
    pub fn send_reset(&self) {
        let mut inner = self.inner.lock();
        if inner.phase != ConnectionPhase::Closed {
            let seq = inner.state.next_seq();
            self.transmit(&mut inner, PacketType::Reset, seq, &[], timestamp_us());
        }
    }

    /// Mark the connection closed. Returns `true` only for the first call.
    ///
    /// A pending connect waiter is woken with an error.
    pub fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut inner = self.inner.lock();
        inner.phase = ConnectionPhase::Closed;
        inner.established = None;
        true
    }

    fn send_state(&self, inner: &mut Inner, now: u32) {
        let seq = inner.state.next_seq();
        self.transmit(inner, PacketType::State, seq, &[], now);
    }

    fn record_type(inner: &Inner, seq: u16) -> PacketType {
        if inner.phase == ConnectionPhase::SynSent && inner.syn_seq == Some(seq) {
            PacketType::Syn
        } else {
            PacketType::Data
        }
    }

    fn transmit(
        &self,
        inner: &mut Inner,
        packet_type: PacketType,
        seq: u16,
        payload: &[u8],
        now: u32,
    ) {
        let connection_id = match packet_type {
            PacketType::Syn => self.key.conn_id,
            _ => self.send_id,
        };
        let header = Header::new(packet_type, connection_id, seq, inner.state.expected_seq())
            .with_timestamps(now, inner.reply_micro)
            .with_window(inner.state.advertised_window());
        let datagram = encode(&header, payload);

        inner.state.stats_mut().packets_sent += 1;
        if let Err(e) = self.ctx.sink.send_to(self.key.remote_addr, &datagram) {
            // Left in the send window; the sweep retries it
            tracing::warn!(
                "Failed to send {} seq {} on {}: {}",
                packet_type,
                seq,
                self.key,
                e
            );
        }
    }

    /// Registry key.
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Connection id inbound packets carry.
    pub fn recv_id(&self) -> u16 {
        self.key.conn_id
    }

    /// Connection id outbound packets carry.
    pub fn send_id(&self) -> u16 {
        self.send_id
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.inner.lock().phase
    }

    /// `true` once the handshake has completed and until teardown.
    pub fn is_established(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    /// `true` once torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the datagram sink is still usable.
    pub fn sink_available(&self) -> bool {
        self.ctx.sink.is_available()
    }

    /// Time since the last inbound packet (or creation).
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.lock().last_received)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().state.stats().clone()
    }

    /// Bytes sent but not yet acknowledged.
    pub fn in_flight_bytes(&self) -> usize {
        self.inner.lock().state.in_flight_bytes()
    }

    /// Bytes that may still be sent before the window is full.
    pub fn remaining_capacity(&self) -> usize {
        self.inner.lock().state.remaining_capacity()
    }

    /// Packets that may still be sent before the congestion window is full.
    pub fn packet_capacity(&self) -> usize {
        self.inner.lock().state.packet_capacity()
    }

    /// See [`ConnectionState::congestion_gated`].
    pub fn congestion_gated(&self) -> bool {
        self.inner.lock().state.congestion_gated()
    }

    /// Current retransmission timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.lock().state.timeout()
    }

    /// Run `f` against the window state under the connection lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&ConnectionState) -> R) -> R {
        f(&self.inner.lock().state)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("send_id", &self.send_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DecodeError;
    use crate::core::constants::{MIN_CONGESTION_WINDOW, TIMEOUT_FLOOR_US};
    use crate::transport::testing::{RecordingSink, peer_addr};
    use std::sync::mpsc as std_mpsc;

    struct Fixture {
        sink: Arc<RecordingSink>,
        ctx: ConnectionContext,
        decoded: std_mpsc::Receiver<Vec<u8>>,
    }

    fn fixture(config: ConnectionConfig) -> Fixture {
        let sink = Arc::new(RecordingSink::new());
        let (tx, decoded) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        let decoder = move |bytes: Vec<u8>| -> Result<(), DecodeError> {
            let _ = tx.lock().send(bytes);
            Ok(())
        };
        let dyn_sink: Arc<dyn DatagramSink> = sink.clone();
        let ctx = ConnectionContext {
            sink: dyn_sink,
            pool: Arc::new(DispatchPool::new(1).unwrap()),
            decoder: Arc::new(decoder),
            config,
        };
        Fixture { sink, ctx, decoded }
    }

    fn established(fx: &Fixture) -> Connection {
        let first = Header::new(PacketType::Data, 50, 2, 0);
        Connection::implicit(ConnectionKey::new(peer_addr(), 50), &first, fx.ctx.clone())
    }

    #[test]
    fn test_outbound_handshake() {
        let fx = fixture(ConnectionConfig::default());
        let conn = Connection::outbound(ConnectionKey::new(peer_addr(), 100), fx.ctx.clone());
        assert_eq!(conn.send_id(), 101);

        let mut established = conn.connect().unwrap();
        let sent = fx.sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.packet_type, PacketType::Syn);
        assert_eq!(sent[0].0.connection_id, 100);
        assert_eq!(sent[0].0.seq_nr, 1);
        assert!(matches!(
            conn.send(b"early"),
            Err(TransportError::NotEstablished)
        ));

        let state = Header::new(PacketType::State, 100, 1, 1).with_window(65536);
        assert_eq!(conn.on_packet(&state, &[]), None);

        assert!(established.try_recv().is_ok());
        assert_eq!(conn.phase(), ConnectionPhase::Connected);
        assert_eq!(conn.in_flight_bytes(), 0);
        conn.with_state(|state| {
            assert_eq!(state.send_window_len(), 0);
            assert_eq!(state.expected_seq(), 0);
        });
    }

    #[test]
    fn test_connect_twice_refused() {
        let fx = fixture(ConnectionConfig::default());
        let conn = Connection::outbound(ConnectionKey::new(peer_addr(), 7), fx.ctx.clone());
        let _rx = conn.connect().unwrap();
        assert!(conn.connect().is_err());
    }

    #[test]
    fn test_accepting_handshake() {
        let fx = fixture(ConnectionConfig::default());
        let conn = Connection::accepting(peer_addr(), 100, fx.ctx.clone());
        assert_eq!(conn.key().conn_id, 101);
        assert_eq!(conn.send_id(), 100);
        assert_eq!(conn.phase(), ConnectionPhase::SynRecv);

        let syn = Header::new(PacketType::Syn, 100, 1, 0).with_timestamps(5, 0);
        assert_eq!(conn.on_packet(&syn, &[]), None);

        let sent = fx.sink.take();
        assert_eq!(sent.len(), 1);
        let reply = &sent[0].0;
        assert_eq!(reply.packet_type, PacketType::State);
        assert_eq!(reply.connection_id, 100);
        assert_eq!(reply.ack_nr, 1);
        assert_eq!(reply.seq_nr, 1);
        assert!(conn.is_established());

        // A duplicate SYN is answered again without moving the cursor
        conn.on_packet(&syn, &[]);
        let sent = fx.sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.ack_nr, 1);
    }

    #[test]
    fn test_data_is_acked_and_delivered() {
        let fx = fixture(ConnectionConfig::default());
        let conn = Connection::accepting(peer_addr(), 100, fx.ctx.clone());
        conn.on_packet(&Header::new(PacketType::Syn, 100, 1, 0), &[]);
        fx.sink.take();

        conn.on_packet(&Header::new(PacketType::Data, 101, 3, 0), b"b");
        let sent = fx.sink.take();
        assert_eq!(sent[0].0.packet_type, PacketType::State);
        assert_eq!(sent[0].0.ack_nr, 1);
        assert_eq!(sent[0].0.window_size, (WINDOW_BUDGET - 1) as u32);

        conn.on_packet(&Header::new(PacketType::Data, 101, 2, 0), b"a");
        let sent = fx.sink.take();
        assert_eq!(sent[0].0.ack_nr, 3);
        assert_eq!(sent[0].0.window_size, WINDOW_BUDGET as u32);

        let delivered = fx
            .decoded
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(delivered, b"ab".to_vec());
    }

    #[test]
    fn test_implicit_connection_delivers_first_packet() {
        let fx = fixture(ConnectionConfig::default());
        let conn = established(&fx);
        assert_eq!(conn.send_id(), 49);

        conn.on_packet(&Header::new(PacketType::Data, 50, 2, 0), b"hello");
        assert_eq!(
            fx.decoded.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"hello".to_vec()
        );
    }

    #[test]
    fn test_implicit_connection_reorders_first_packets() {
        let fx = fixture(ConnectionConfig::default());
        let first = Header::new(PacketType::Data, 50, 3, 0);
        let key = ConnectionKey::new(peer_addr(), 50);
        let conn = Connection::implicit(key, &first, fx.ctx.clone());

        conn.on_packet(&first, b"B");
        conn.on_packet(&Header::new(PacketType::Data, 50, 2, 0), b"A");

        assert_eq!(
            fx.decoded.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"AB".to_vec()
        );
        assert_eq!(conn.stats().duplicates_dropped, 0);
        conn.with_state(|state| assert_eq!(state.expected_seq(), 3));
    }

    #[test]
    fn test_data_before_state_establishes_at_first_seq() {
        let fx = fixture(ConnectionConfig::default());
        let conn = Connection::outbound(ConnectionKey::new(peer_addr(), 100), fx.ctx.clone());
        let mut established = conn.connect().unwrap();

        // The STATE reply was lost and the responder's first two DATA swapped
        conn.on_packet(&Header::new(PacketType::Data, 100, 2, 0), b"2");
        conn.on_packet(&Header::new(PacketType::Data, 100, 1, 0), b"1");

        assert!(established.try_recv().is_ok());
        assert_eq!(
            fx.decoded.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"12".to_vec()
        );
    }

    #[test]
    fn test_send_splits_into_chunks() {
        let fx = fixture(ConnectionConfig {
            max_payload: 4,
            ..ConnectionConfig::default()
        });
        let conn = established(&fx);

        assert_eq!(conn.send(b"abcdefghij").unwrap(), 3);

        let sent = fx.sink.take();
        let payloads: Vec<&[u8]> = sent.iter().map(|(_, p)| p.as_slice()).collect();
        assert_eq!(payloads, vec![&b"abcd"[..], &b"efgh"[..], &b"ij"[..]]);
        let seqs: Vec<u16> = sent.iter().map(|(h, _)| h.seq_nr).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(sent.iter().all(|(h, _)| h.connection_id == 49));
        assert_eq!(conn.in_flight_bytes(), 10);
    }

    #[test]
    fn test_send_window_full() {
        let fx = fixture(ConnectionConfig {
            window_budget: 8,
            ..ConnectionConfig::default()
        });
        let conn = established(&fx);

        let err = conn.send(&[0; 10]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::WindowFull {
                requested: 10,
                available: 8
            }
        ));
        assert!(fx.sink.take().is_empty());
        assert_eq!(conn.remaining_capacity(), 8);
    }

    #[test]
    fn test_send_limited_by_congestion_window() {
        let fx = fixture(ConnectionConfig {
            max_payload: 10,
            ..ConnectionConfig::default()
        });
        let conn = established(&fx);
        assert_eq!(conn.packet_capacity(), MIN_CONGESTION_WINDOW);

        let err = conn.send(&[0; 10 * MIN_CONGESTION_WINDOW + 1]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::CongestionWindowFull {
                requested: 17,
                available: 16
            }
        ));
        assert!(fx.sink.take().is_empty());

        assert_eq!(conn.send(&[0; 10 * MIN_CONGESTION_WINDOW]).unwrap(), 16);
        assert_eq!(conn.packet_capacity(), 0);
        assert!(matches!(
            conn.send(b"x"),
            Err(TransportError::CongestionWindowFull { .. })
        ));

        // A clean ack frees the acked packets and grows the window by one
        fx.sink.take();
        let ack = Header::new(PacketType::State, 50, 1, 4).with_window(4096);
        conn.on_packet(&ack, &[]);
        conn.with_state(|state| {
            assert_eq!(state.congestion_window(), MIN_CONGESTION_WINDOW + 1);
        });
        assert_eq!(conn.packet_capacity(), 5);
    }

    #[test]
    fn test_send_refused_when_unavailable() {
        let fx = fixture(ConnectionConfig::default());
        let conn = established(&fx);
        fx.sink.set_available(false);

        assert!(matches!(conn.send(b"x"), Err(TransportError::Unavailable)));
        assert!(!conn.sink_available());
    }

    #[test]
    fn test_failed_send_stays_in_window() {
        let fx = fixture(ConnectionConfig::default());
        let conn = established(&fx);
        fx.sink.set_failing(true);

        assert_eq!(conn.send(b"lost").unwrap(), 1);
        assert_eq!(conn.in_flight_bytes(), 4);

        fx.sink.set_failing(false);
        let later = timestamp_us().wrapping_add(TIMEOUT_FLOOR_US + 1);
        assert_eq!(conn.retransmit_overdue(later).unwrap(), 1);
        assert_eq!(fx.sink.take()[0].1, b"lost".to_vec());
    }

    #[test]
    fn test_fast_retransmit_after_duplicate_acks() {
        let fx = fixture(ConnectionConfig {
            max_payload: 1,
            ..ConnectionConfig::default()
        });
        let conn = established(&fx);
        conn.send(b"xyz").unwrap();
        fx.sink.take();

        let dup = Header::new(PacketType::State, 50, 1, 0).with_window(4096);
        for _ in 0..FAST_ACK_RETRY_TIMES {
            conn.on_packet(&dup, &[]);
        }
        assert!(fx.sink.take().is_empty());

        conn.on_packet(&dup, &[]);
        let sent = fx.sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.packet_type, PacketType::Data);
        assert_eq!(sent[0].0.seq_nr, 1);
        assert_eq!(sent[0].1, b"x".to_vec());
        assert_eq!(conn.stats().fast_retransmits, 1);
    }

    #[test]
    fn test_retry_exhaustion() {
        let fx = fixture(ConnectionConfig::default());
        let conn = established(&fx);
        conn.send(b"data").unwrap();
        fx.sink.take();

        let mut now = timestamp_us();
        for _ in 0..MAX_PUSH_TIMES {
            now = now.wrapping_add(TIMEOUT_FLOOR_US + 1);
            assert_eq!(conn.retransmit_overdue(now).unwrap(), 1);
        }
        now = now.wrapping_add(TIMEOUT_FLOOR_US + 1);
        assert!(matches!(
            conn.retransmit_overdue(now),
            Err(TransportError::MaxRetransmitsExceeded)
        ));
        assert_eq!(fx.sink.take().len(), MAX_PUSH_TIMES as usize);
    }

    #[test]
    fn test_syn_is_retransmitted_as_syn() {
        let fx = fixture(ConnectionConfig::default());
        let conn = Connection::outbound(ConnectionKey::new(peer_addr(), 9), fx.ctx.clone());
        let _rx = conn.connect().unwrap();
        fx.sink.take();

        let later = timestamp_us().wrapping_add(TIMEOUT_FLOOR_US + 1);
        assert_eq!(conn.retransmit_overdue(later).unwrap(), 1);
        let sent = fx.sink.take();
        assert_eq!(sent[0].0.packet_type, PacketType::Syn);
        assert_eq!(sent[0].0.connection_id, 9);
    }

    #[test]
    fn test_fin_requests_teardown() {
        let fx = fixture(ConnectionConfig::default());
        let conn = established(&fx);

        let fin = Header::new(PacketType::Fin, 50, 10, 0);
        assert_eq!(conn.on_packet(&fin, &[]), Some(CloseReason::PeerFin));
        assert_eq!(fx.sink.take()[0].0.packet_type, PacketType::State);

        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        assert_eq!(conn.phase(), ConnectionPhase::Closed);

        // Closed connections drop everything
        assert_eq!(conn.on_packet(&fin, &[]), None);
        assert!(fx.sink.take().is_empty());
        assert!(matches!(
            conn.send(b"x"),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_fin_discards_data_behind_gap() {
        let fx = fixture(ConnectionConfig::default());
        let conn = established(&fx);

        // seq 2 is missing; seq 3 waits in the reorder buffer
        conn.on_packet(&Header::new(PacketType::Data, 50, 3, 0), b"late");
        conn.with_state(|state| assert_eq!(state.recv_window_len(), 1));

        let fin = Header::new(PacketType::Fin, 50, 4, 0);
        assert_eq!(conn.on_packet(&fin, &[]), Some(CloseReason::PeerFin));
        assert!(conn.mark_closed());

        conn.on_packet(&Header::new(PacketType::Data, 50, 2, 0), b"gap");
        assert!(fx.decoded.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(conn.stats().bytes_received, 0);
    }

    #[test]
    fn test_reset_requests_teardown() {
        let fx = fixture(ConnectionConfig::default());
        let conn = established(&fx);
        let reset = Header::new(PacketType::Reset, 50, 10, 0);
        assert_eq!(conn.on_packet(&reset, &[]), Some(CloseReason::PeerReset));
    }

    #[test]
    fn test_close_wakes_connect_waiter() {
        let fx = fixture(ConnectionConfig::default());
        let conn = Connection::outbound(ConnectionKey::new(peer_addr(), 1), fx.ctx.clone());
        let mut rx = conn.connect().unwrap();

        assert!(conn.mark_closed());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fin_and_reset_on_wire() {
        let fx = fixture(ConnectionConfig::default());
        let conn = established(&fx);
        conn.send(b"a").unwrap();
        fx.sink.take();

        conn.send_fin();
        conn.send_reset();
        let sent = fx.sink.take();
        assert_eq!(sent[0].0.packet_type, PacketType::Fin);
        assert_eq!(sent[0].0.seq_nr, 2);
        assert_eq!(sent[1].0.packet_type, PacketType::Reset);
        assert_eq!(sent[1].0.connection_id, 49);
    }

    #[test]
    fn test_stats_track_traffic() {
        let fx = fixture(ConnectionConfig::default());
        let conn = established(&fx);
        conn.on_packet(&Header::new(PacketType::Data, 50, 2, 0), b"abc");
        conn.on_packet(&Header::new(PacketType::Data, 50, 2, 0), b"abc");
        conn.send(b"hello").unwrap();

        let stats = conn.stats();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.bytes_received, 3);
        assert_eq!(stats.duplicates_dropped, 1);
        // Two STATE replies plus one DATA
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.bytes_sent, 5);
    }
}
