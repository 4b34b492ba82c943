//! Metrics sink consumed by the selectors.
//!
//! The selector only ever writes to the sink. Its lifecycle belongs to the
//! caller, who constructs it once and passes it in explicitly.

use crate::error::Fault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Write-only sink for selector counters and timers.
pub trait NetworkMetrics: Send + Sync {
    /// A connection record was created by `connect`.
    fn connection_created(&self);

    /// A connection record was torn down, for any reason.
    fn connection_closed(&self);

    fn bytes_sent(&self, bytes: u64);

    fn bytes_received(&self, bytes: u64);

    /// Time from the first byte of a frame to its full reassembly.
    fn receive_latency(&self, latency: Duration);

    /// Time spent blocked in the readiness wait.
    fn select_time(&self, _elapsed: Duration) {}

    /// Time spent driving reads and writes after a wait.
    fn io_time(&self, _elapsed: Duration) {}

    /// A connection was torn down because of `fault`.
    fn connection_fault(&self, _fault: &Fault) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl NetworkMetrics for NoopMetrics {
    fn connection_created(&self) {}
    fn connection_closed(&self) {}
    fn bytes_sent(&self, _bytes: u64) {}
    fn bytes_received(&self, _bytes: u64) {}
    fn receive_latency(&self, _latency: Duration) {}
}

/// Keeps running totals in atomics. Handy for tests and for embedders that
/// scrape counters periodically.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    receives_timed: AtomicU64,
    receive_latency_nanos: AtomicU64,
    select_calls: AtomicU64,
    faults: AtomicU64,
}

/// Point-in-time copy of [`InMemoryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_created: u64,
    pub connections_closed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub receives_timed: u64,
    pub total_receive_latency: Duration,
    pub select_calls: u64,
    pub faults: u64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            receives_timed: self.receives_timed.load(Ordering::Relaxed),
            total_receive_latency: Duration::from_nanos(
                self.receive_latency_nanos.load(Ordering::Relaxed),
            ),
            select_calls: self.select_calls.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

impl NetworkMetrics for InMemoryMetrics {
    fn connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    fn bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    fn receive_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.receives_timed.fetch_add(1, Ordering::Relaxed);
        self.receive_latency_nanos
            .fetch_add(nanos, Ordering::Relaxed);
    }

    fn select_time(&self, _elapsed: Duration) {
        self.select_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_fault(&self, _fault: &Fault) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }
}
