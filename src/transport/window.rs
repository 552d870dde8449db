//! Per-connection sliding window state.
//!
//! [`ConnectionState`] owns one connection's send window, receive reorder
//! buffer, sequence counters and RTO estimator. It is plain data: callers
//! serialize access with a per-connection lock (see
//! [`Connection`](super::Connection)).
//!
//! Every time-dependent operation has an `_at` variant taking the current
//! microsecond clock explicitly; the plain variants read
//! [`timestamp_us`](super::packet::timestamp_us).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::core::constants::{
    INITIAL_SEQ_NR, MAX_CONGESTION_WINDOW, MIN_CONGESTION_WINDOW, WINDOW_BUDGET,
};

use super::packet::{PacketRecord, timestamp_us};
use super::seq::{seq_covered, seq_diff};
use super::timing::RtoEstimator;

/// Registry key of a connection: remote address plus the local `recv_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Remote peer address.
    pub remote_addr: SocketAddr,
    /// Connection id inbound packets carry.
    pub conn_id: u16,
}

impl ConnectionKey {
    /// Create a key.
    pub fn new(remote_addr: SocketAddr, conn_id: u16) -> Self {
        Self {
            remote_addr,
            conn_id,
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.remote_addr, self.conn_id)
    }
}

/// Result of processing one acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckOutcome {
    /// Records removed from the send window.
    pub acked: usize,
    /// Payload bytes released.
    pub acked_bytes: usize,
    /// Consecutive acks (including this one) that removed nothing.
    pub unproductive_acks: u32,
}

impl AckOutcome {
    /// `true` if the ack removed nothing, hinting at a lost packet.
    pub fn loss_suspected(&self) -> bool {
        self.acked == 0
    }
}

/// Result of a retransmission scan.
#[derive(Debug, Clone, Default)]
pub struct RetransmitScan {
    /// Overdue records to put back on the wire, timestamps refreshed.
    pub resend: Vec<PacketRecord>,
    /// A record went past the retry cap; the connection must be torn down.
    pub exhausted: bool,
}

/// Per-connection counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Packets sent, retransmissions included.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_received: u64,
    /// Payload bytes enqueued for sending.
    pub bytes_sent: u64,
    /// Payload bytes delivered in order.
    pub bytes_received: u64,
    /// Timeout-driven retransmissions.
    pub retransmits: u64,
    /// Duplicate-ack-driven retransmissions.
    pub fast_retransmits: u64,
    /// Inbound packets dropped as already delivered.
    pub duplicates_dropped: u64,
    /// Out-of-order packets dropped because the reorder buffer was full.
    pub overflow_dropped: u64,
}

/// Sliding window state of one connection.
#[derive(Debug)]
pub struct ConnectionState {
    key: ConnectionKey,

    /// Sent records awaiting acknowledgment.
    send_window: HashMap<u16, PacketRecord>,
    /// Sum of payload lengths in `send_window`.
    in_flight_bytes: usize,
    /// Next sequence number to assign.
    next_seq: u16,

    /// Received records awaiting reassembly.
    recv_window: HashMap<u16, PacketRecord>,
    /// Sum of payload lengths in `recv_window`.
    recv_buffered_bytes: usize,
    /// Last sequence number delivered in order.
    expected_seq: u16,
    /// Timestamp of the packet at `expected_seq`.
    expected_timestamp: u32,

    rto: RtoEstimator,

    peer_window_size: u32,
    max_observed_peer_window: u32,
    window_budget: usize,
    /// Packets allowed in flight.
    congestion_window: usize,
    unproductive_acks: u32,

    stats: ConnectionStats,
}

impl ConnectionState {
    /// Create state with the default 1 MiB window budget.
    pub fn new(key: ConnectionKey) -> Self {
        Self::with_budget(key, WINDOW_BUDGET)
    }

    /// Create state with a custom window budget.
    pub fn with_budget(key: ConnectionKey, window_budget: usize) -> Self {
        Self {
            key,
            send_window: HashMap::new(),
            in_flight_bytes: 0,
            next_seq: INITIAL_SEQ_NR,
            recv_window: HashMap::new(),
            recv_buffered_bytes: 0,
            expected_seq: 0,
            expected_timestamp: 0,
            rto: RtoEstimator::new(),
            peer_window_size: 0,
            max_observed_peer_window: 0,
            window_budget,
            congestion_window: MIN_CONGESTION_WINDOW,
            unproductive_acks: 0,
            stats: ConnectionStats::default(),
        }
    }

    /// Start numbering outbound packets at `seq`.
    pub fn with_next_seq(mut self, seq: u16) -> Self {
        self.next_seq = seq;
        self
    }

    /// Set the receive cursor: `seq` is treated as already delivered.
    pub fn connect(&mut self, timestamp: u32, seq: u16) {
        self.expected_seq = seq;
        self.expected_timestamp = timestamp;
    }

    // ---------------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------------

    /// Store a new outbound record and return a copy for transmission.
    ///
    /// `None` is a pure control packet: it consumes a sequence number but
    /// adds nothing to `in_flight_bytes`.
    pub fn enqueue(&mut self, payload: Option<Vec<u8>>) -> PacketRecord {
        self.enqueue_at(payload, timestamp_us())
    }

    /// [`enqueue`](Self::enqueue) with an explicit clock.
    pub fn enqueue_at(&mut self, payload: Option<Vec<u8>>, now: u32) -> PacketRecord {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let record = PacketRecord::new(seq, now, payload.unwrap_or_default());
        self.in_flight_bytes += record.len();
        self.stats.bytes_sent += record.len() as u64;
        if let Some(stale) = self.send_window.insert(seq, record.clone()) {
            // A full 2^16 lap of unacked packets; keep the accounting exact.
            self.in_flight_bytes -= stale.len();
        }
        record
    }

    /// Window budget minus bytes in flight.
    pub fn remaining_capacity(&self) -> usize {
        self.window_budget.saturating_sub(self.in_flight_bytes)
    }

    /// Packets that may still be sent before the congestion window is full.
    pub fn packet_capacity(&self) -> usize {
        self.congestion_window.saturating_sub(self.send_window.len())
    }

    /// `true` while in-flight bytes stay under a quarter of the largest
    /// window the peer has advertised.
    ///
    /// A conservative throttle for the upper layer, not congestion control.
    pub fn congestion_gated(&self) -> bool {
        self.in_flight_bytes < (self.max_observed_peer_window / 4) as usize
    }

    /// Process a cumulative acknowledgment.
    pub fn on_ack(&mut self, acknr: u16, advertised_window: u32) -> AckOutcome {
        self.on_ack_at(acknr, advertised_window, timestamp_us())
    }

    /// [`on_ack`](Self::on_ack) with an explicit clock.
    pub fn on_ack_at(&mut self, acknr: u16, advertised_window: u32, now: u32) -> AckOutcome {
        self.peer_window_size = advertised_window;
        self.max_observed_peer_window = self.max_observed_peer_window.max(advertised_window);

        let covered: Vec<u16> = self
            .send_window
            .keys()
            .copied()
            .filter(|&seq| seq_covered(seq, acknr))
            .collect();
        let removed: Vec<PacketRecord> = covered
            .into_iter()
            .filter_map(|seq| self.send_window.remove(&seq))
            .collect();

        let mut outcome = AckOutcome::default();
        for record in &removed {
            self.in_flight_bytes -= record.len();
            self.rto.update(record.age(now));
            outcome.acked += 1;
            outcome.acked_bytes += record.len();
        }

        if outcome.acked == 0 {
            self.unproductive_acks += 1;
        } else {
            self.unproductive_acks = 0;
            self.adjust_congestion_window();
        }
        outcome.unproductive_acks = self.unproductive_acks;
        outcome
    }

    /// Grow by one packet while the timeout sits at its floor, halve
    /// otherwise. Stays within `[MIN_CONGESTION_WINDOW, MAX_CONGESTION_WINDOW]`.
    fn adjust_congestion_window(&mut self) {
        self.congestion_window = if self.rto.at_floor() {
            (self.congestion_window + 1).min(MAX_CONGESTION_WINDOW)
        } else {
            (self.congestion_window / 2).max(MIN_CONGESTION_WINDOW)
        };
    }

    /// Remove one record without taking an RTT sample.
    pub fn discard(&mut self, seq: u16) -> Option<PacketRecord> {
        let record = self.send_window.remove(&seq)?;
        self.in_flight_bytes -= record.len();
        Some(record)
    }

    /// First record past `acknr`, the fast-retransmit candidate.
    ///
    /// Counts as a send; the unproductive-ack counter restarts.
    pub fn take_fast_retransmit(&mut self, acknr: u16, now: u32) -> Option<PacketRecord> {
        let record = self.send_window.get_mut(&acknr.wrapping_add(1))?;
        record.timestamp = now;
        self.unproductive_acks = 0;
        self.stats.fast_retransmits += 1;
        Some(record.clone())
    }

    /// Collect overdue records for retransmission.
    ///
    /// Each record older than the current timeout has its retry count
    /// bumped. Past `max_push_times` the scan reports exhaustion instead of
    /// resending anything.
    pub fn retransmit_overdue_at(&mut self, now: u32, max_push_times: u32) -> RetransmitScan {
        let timeout = self.rto.timeout_us();
        let next_seq = self.next_seq;
        let mut scan = RetransmitScan::default();

        let mut overdue: Vec<&mut PacketRecord> = self
            .send_window
            .values_mut()
            .filter(|record| record.age(now) > timeout)
            .collect();
        overdue.sort_by_key(|record| seq_diff(record.seq, next_seq));

        for record in overdue {
            record.retry_count += 1;
            if record.retry_count > max_push_times {
                scan.exhausted = true;
            } else {
                record.timestamp = now;
                scan.resend.push(record.clone());
            }
        }

        if scan.exhausted {
            scan.resend.clear();
        } else {
            self.stats.retransmits += scan.resend.len() as u64;
        }
        scan
    }

    // ---------------------------------------------------------------------
    // Receive path
    // ---------------------------------------------------------------------

    /// Buffer an inbound packet and return whatever became contiguous.
    ///
    /// Packets at or before the cursor are duplicates and change nothing.
    /// An out-of-order packet that would push the buffered bytes past the
    /// window budget is dropped unchanged; the sender retransmits it. The
    /// packet right after the cursor is always taken since it drains.
    pub fn receive(&mut self, timestamp: u32, seq: u16, payload: Vec<u8>) -> Option<Vec<u8>> {
        if seq_diff(self.expected_seq, seq) >= 0 {
            self.stats.duplicates_dropped += 1;
            return None;
        }
        let in_order = seq == self.expected_seq.wrapping_add(1);
        if !in_order
            && !self.recv_window.contains_key(&seq)
            && self.recv_buffered_bytes + payload.len() > self.window_budget
        {
            self.stats.overflow_dropped += 1;
            return None;
        }

        let record = PacketRecord::new(seq, timestamp, payload);
        self.recv_buffered_bytes += record.len();
        if let Some(previous) = self.recv_window.insert(seq, record) {
            self.recv_buffered_bytes -= previous.len();
        }

        let mut output = Vec::new();
        let mut next = self.expected_seq.wrapping_add(1);
        while let Some(record) = self.recv_window.remove(&next) {
            self.recv_buffered_bytes -= record.len();
            self.expected_seq = next;
            self.expected_timestamp = record.timestamp;
            output.extend_from_slice(&record.payload);
            next = next.wrapping_add(1);
        }

        if output.is_empty() {
            return None;
        }
        self.stats.bytes_received += output.len() as u64;
        Some(output)
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Registry key.
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Bytes currently in flight.
    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight_bytes
    }

    /// Congestion window in packets.
    pub fn congestion_window(&self) -> usize {
        self.congestion_window
    }

    /// Number of unacknowledged records.
    pub fn send_window_len(&self) -> usize {
        self.send_window.len()
    }

    /// Sequence numbers currently awaiting acknowledgment, in send order.
    pub fn unacked_seqs(&self) -> Vec<u16> {
        let mut seqs: Vec<u16> = self.send_window.keys().copied().collect();
        seqs.sort_by_key(|&seq| seq_diff(seq, self.next_seq));
        seqs
    }

    /// Look up an unacknowledged record.
    pub fn unacked(&self, seq: u16) -> Option<&PacketRecord> {
        self.send_window.get(&seq)
    }

    /// Next sequence number `enqueue` will assign.
    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    /// Payload bytes held in the reorder buffer.
    pub fn recv_buffered_bytes(&self) -> usize {
        self.recv_buffered_bytes
    }

    /// Number of out-of-order records buffered.
    pub fn recv_window_len(&self) -> usize {
        self.recv_window.len()
    }

    /// Last sequence number delivered in order.
    pub fn expected_seq(&self) -> u16 {
        self.expected_seq
    }

    /// Timestamp of the last packet delivered in order.
    pub fn expected_timestamp(&self) -> u32 {
        self.expected_timestamp
    }

    /// Receive window to advertise: budget minus buffered bytes.
    pub fn advertised_window(&self) -> u32 {
        self.window_budget
            .saturating_sub(self.recv_buffered_bytes)
            .min(u32::MAX as usize) as u32
    }

    /// Most recent window the peer advertised.
    pub fn peer_window_size(&self) -> u32 {
        self.peer_window_size
    }

    /// Largest window the peer has advertised.
    pub fn max_observed_peer_window(&self) -> u32 {
        self.max_observed_peer_window
    }

    /// RTO estimator.
    pub fn rto(&self) -> &RtoEstimator {
        &self.rto
    }

    /// Current retransmission timeout.
    pub fn timeout(&self) -> Duration {
        self.rto.timeout()
    }

    /// Counters.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Mutable counters.
    pub fn stats_mut(&mut self) -> &mut ConnectionStats {
        &mut self.stats
    }
}
