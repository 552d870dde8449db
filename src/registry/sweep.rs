//! Timeout sweep driver.
//!
//! Every tick walks a registry snapshot and, per connection:
//!
//! 1. closes it if the datagram sink reports the transport unavailable,
//! 2. closes it if nothing arrived for the idle timeout,
//! 3. retransmits overdue records, closing it once a record passes the
//!    retry cap.
//!
//! Teardown goes through [`ConnectionRegistry::close`], so it happens
//! exactly once even if a packet handler races the sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::transport::{CloseReason, TransportError, timestamp_us};

use super::registry::ConnectionRegistry;

/// What one sweep pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections inspected.
    pub scanned: usize,
    /// Records put back on the wire.
    pub retransmitted: usize,
    /// Connections torn down.
    pub closed: usize,
}

/// Run one sweep pass.
///
/// `now_us` is the packet clock used for retransmission ages, `now` the
/// monotonic clock used for idleness.
pub fn sweep_once(
    registry: &ConnectionRegistry,
    now_us: u32,
    now: Instant,
    idle_timeout: Duration,
) -> SweepReport {
    let mut report = SweepReport::default();

    for conn in registry.snapshot() {
        if conn.is_closed() {
            continue;
        }
        report.scanned += 1;

        if !conn.sink_available() {
            if registry.close(&conn, CloseReason::Unavailable) {
                report.closed += 1;
            }
            continue;
        }

        if conn.idle_for(now) >= idle_timeout {
            conn.send_reset();
            if registry.close(&conn, CloseReason::Idle) {
                report.closed += 1;
            }
            continue;
        }

        match conn.retransmit_overdue(now_us) {
            Ok(count) => report.retransmitted += count,
            Err(TransportError::MaxRetransmitsExceeded) => {
                if registry.close(&conn, CloseReason::RetriesExhausted) {
                    report.closed += 1;
                }
            }
            Err(e) => {
                tracing::debug!("Sweep skipped {}: {}", conn.key(), e);
            }
        }
    }

    report
}

/// Background task running [`sweep_once`] on a fixed interval.
#[derive(Debug)]
pub struct SweepDriver {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweepDriver {
    /// Spawn the driver on the current tokio runtime.
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = sweep_once(
                            &registry,
                            timestamp_us(),
                            Instant::now(),
                            idle_timeout,
                        );
                        if report.retransmitted > 0 || report.closed > 0 {
                            tracing::debug!(
                                "Sweep: {} connections, {} retransmitted, {} closed",
                                report.scanned,
                                report.retransmitted,
                                report.closed
                            );
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            tracing::debug!("Sweep driver stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Stop the driver and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for SweepDriver {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
