//! Endpoint configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::core::UtpError;
use crate::core::constants::{
    CONNECT_TIMEOUT, DISPATCH_QUEUE_COUNT, FAST_ACK_RETRY_TIMES, IDLE_TIMEOUT, MAX_PAYLOAD_SIZE,
    MAX_PUSH_TIMES, SWEEP_INTERVAL, WINDOW_BUDGET,
};
use crate::transport::{ConnectionConfig, DEFAULT_RECV_BUFFER_SIZE};

/// Endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Per-connection send window budget in bytes.
    pub window_budget: usize,

    /// Largest payload per DATA packet.
    pub max_payload: usize,

    /// Retransmissions allowed per packet before teardown.
    pub max_push_times: u32,

    /// Consecutive duplicate acks tolerated before a fast retransmit.
    pub fast_ack_retry_times: u32,

    /// Interval between timeout sweeps.
    pub sweep_interval: Duration,

    /// How long `connect` waits for the handshake.
    pub connect_timeout: Duration,

    /// Connections with no inbound traffic for this long are closed.
    pub idle_timeout: Duration,

    /// Number of dispatch queues (worker threads).
    pub dispatch_queues: usize,

    /// Socket receive buffer size.
    pub recv_buffer_size: usize,
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            window_budget: WINDOW_BUDGET,
            max_payload: MAX_PAYLOAD_SIZE,
            max_push_times: MAX_PUSH_TIMES,
            fast_ack_retry_times: FAST_ACK_RETRY_TIMES,
            sweep_interval: SWEEP_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            dispatch_queues: DISPATCH_QUEUE_COUNT,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

impl UtpConfig {
    /// Check the values an endpoint cannot run with.
    pub fn validate(&self) -> Result<(), UtpError> {
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD_SIZE {
            return Err(UtpError::Config(format!(
                "max_payload must be in 1..={MAX_PAYLOAD_SIZE}, got {}",
                self.max_payload
            )));
        }
        if self.window_budget < self.max_payload {
            return Err(UtpError::Config(format!(
                "window_budget ({}) is smaller than max_payload ({})",
                self.window_budget, self.max_payload
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(UtpError::Config("sweep_interval must be non-zero".into()));
        }
        if self.dispatch_queues == 0 {
            return Err(UtpError::Config("dispatch_queues must be at least 1".into()));
        }
        Ok(())
    }

    /// The per-connection subset.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            window_budget: self.window_budget,
            max_payload: self.max_payload,
            max_push_times: self.max_push_times,
            fast_ack_retry_times: self.fast_ack_retry_times,
        }
    }
}

/// Builder for [`UtpConfig`].
#[derive(Debug)]
pub struct UtpConfigBuilder {
    config: UtpConfig,
}

impl UtpConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self {
            config: UtpConfig::default(),
        }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the send window budget.
    pub fn window_budget(mut self, bytes: usize) -> Self {
        self.config.window_budget = bytes;
        self
    }

    /// Set the largest DATA payload.
    pub fn max_payload(mut self, bytes: usize) -> Self {
        self.config.max_payload = bytes;
        self
    }

    /// Set the retransmission cap.
    pub fn max_push_times(mut self, times: u32) -> Self {
        self.config.max_push_times = times;
        self
    }

    /// Set the duplicate-ack threshold for fast retransmit.
    pub fn fast_ack_retry_times(mut self, times: u32) -> Self {
        self.config.fast_ack_retry_times = times;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the number of dispatch queues.
    pub fn dispatch_queues(mut self, count: usize) -> Self {
        self.config.dispatch_queues = count;
        self
    }

    /// Set the socket receive buffer size.
    pub fn recv_buffer_size(mut self, bytes: usize) -> Self {
        self.config.recv_buffer_size = bytes;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<UtpConfig, UtpError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for UtpConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
