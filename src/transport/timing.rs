//! Round-trip time and retransmission timeout estimation.
//!
//! Jacobson/Karels smoothing in integer microseconds:
//!
//! - `delta = rtt - sample`
//! - `rtt_var += (|delta| - rtt_var) / 4`
//! - `rtt += (sample - rtt) / 8`
//! - `timeout = max(rtt + 4 * rtt_var, TIMEOUT_FLOOR)`

use std::time::Duration;

use crate::core::constants::TIMEOUT_FLOOR_US;

/// RTT estimator producing the retransmission timeout of one connection.
///
/// Unlike RFC 6298 there is no special first-sample case: the estimators
/// start at zero and converge, and the timeout never drops below the floor.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    /// Smoothed RTT in microseconds.
    rtt: i64,
    /// Mean deviation in microseconds.
    rtt_var: i64,
    /// Current retransmission timeout in microseconds.
    timeout: i64,
    /// Number of samples taken.
    samples: u64,
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RtoEstimator {
    /// Create an estimator with no samples; the timeout equals the floor.
    pub fn new() -> Self {
        Self {
            rtt: 0,
            rtt_var: 0,
            timeout: TIMEOUT_FLOOR_US as i64,
            samples: 0,
        }
    }

    /// Feed one RTT sample in microseconds.
    pub fn update(&mut self, sample_us: u32) {
        let sample = sample_us as i64;
        let delta = self.rtt - sample;
        self.rtt_var += (delta.abs() - self.rtt_var) / 4;
        self.rtt += (sample - self.rtt) / 8;
        self.timeout = (self.rtt + 4 * self.rtt_var).max(TIMEOUT_FLOOR_US as i64);
        self.samples += 1;
    }

    /// Smoothed RTT in microseconds.
    pub fn rtt_us(&self) -> i64 {
        self.rtt
    }

    /// RTT deviation in microseconds.
    pub fn rtt_var_us(&self) -> i64 {
        self.rtt_var
    }

    /// Current timeout in microseconds.
    pub fn timeout_us(&self) -> u32 {
        self.timeout.clamp(0, u32::MAX as i64) as u32
    }

    /// Current timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us() as u64)
    }

    /// `true` while the estimate has not risen above the floor.
    pub fn at_floor(&self) -> bool {
        self.timeout <= TIMEOUT_FLOOR_US as i64
    }

    /// Number of samples fed so far.
    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}
