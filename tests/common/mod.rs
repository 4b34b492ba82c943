//! Shared helpers for the integration tests.
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! TEST_LOG=2 cargo test --test selector_tcp -- --nocapture
//! ```

#![allow(dead_code)]

use netmux::prelude::*;
use netmux::{SelectorSettings, TcpSelector};
use std::io::{self, Read, Write};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// ============================================================================
// Tracing Setup
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("netmux={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Channel Doubles
// ============================================================================

/// Hands out its bytes in fixed-size pieces, pretending to block between
/// pieces. Reports end of stream once drained, unless `block_at_end` is set.
pub struct ChunkedReader {
    data: Vec<u8>,
    pos: usize,
    chunks: Vec<usize>,
    next_chunk: usize,
    ready: bool,
    pub block_at_end: bool,
}

impl ChunkedReader {
    pub fn new(data: Vec<u8>, chunks: Vec<usize>) -> Self {
        Self {
            data,
            pos: 0,
            chunks,
            next_chunk: 0,
            ready: true,
            block_at_end: true,
        }
    }

    /// Makes the next piece readable, like a fresh readiness event.
    pub fn wake(&mut self) {
        self.ready = true;
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.data.len() {
            if self.block_at_end {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            return Ok(0);
        }
        if !self.ready {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let chunk = self
            .chunks
            .get(self.next_chunk)
            .copied()
            .unwrap_or(usize::MAX)
            .max(1);
        let allowed = chunk.min(self.data.len() - self.pos);
        let n = allowed.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;

        // A piece may be consumed by several small reads.
        let left_in_chunk = allowed - n;
        if left_in_chunk == 0 {
            self.next_chunk += 1;
            self.ready = false;
        } else if let Some(chunk) = self.chunks.get_mut(self.next_chunk) {
            *chunk = left_in_chunk;
        }
        Ok(n)
    }
}

/// Accepts at most `capacity` bytes, then would block until drained.
pub struct ThrottledWriter {
    pub written: Vec<u8>,
    pub capacity: usize,
    buffered: usize,
}

impl ThrottledWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            written: Vec::new(),
            capacity,
            buffered: 0,
        }
    }

    /// Simulates the peer draining the socket buffer.
    pub fn drain(&mut self) {
        self.buffered = 0;
    }
}

impl Write for ThrottledWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.capacity - self.buffered;
        if room == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = room.min(buf.len());
        self.written.extend_from_slice(&buf[..n]);
        self.buffered += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Frame Helpers
// ============================================================================

pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
    buf.extend_from_slice(payload);
    buf
}

// ============================================================================
// Selector Helpers
// ============================================================================

pub fn new_tcp_selector(settings: SelectorSettings) -> (TcpSelector, Arc<InMemoryMetrics>) {
    let metrics = Arc::new(InMemoryMetrics::new());
    let selector = TcpSelector::new(settings, metrics.clone(), Arc::new(SystemClock::new()))
        .expect("Failed to create selector");
    (selector, metrics)
}

/// Everything reported by a run of poll cycles.
#[derive(Debug, Default)]
pub struct Collected {
    pub connected: Vec<ConnectionId>,
    pub disconnected: Vec<ConnectionId>,
    pub completed_sends: Vec<NetworkSend>,
    pub completed_receives: Vec<NetworkReceive>,
}

impl Collected {
    pub fn drain_from(&mut self, selector: &mut impl NetworkSelector) {
        self.connected.extend(selector.connected());
        self.disconnected.extend(selector.disconnected());
        self.completed_sends.extend(selector.completed_sends());
        self.completed_receives.extend(selector.completed_receives());
    }
}

/// Polls with `sends` once, then keeps polling with no sends until `done`
/// holds or `deadline` passes.
pub fn poll_until<S, F>(
    selector: &mut S,
    sends: Vec<NetworkSend>,
    deadline: Duration,
    mut done: F,
) -> Collected
where
    S: NetworkSelector,
    F: FnMut(&Collected) -> bool,
{
    let start = Instant::now();
    let mut collected = Collected::default();
    let mut sends = Some(sends);

    loop {
        selector
            .poll(Duration::from_millis(20), sends.take().unwrap_or_default())
            .expect("poll failed");
        collected.drain_from(selector);
        if done(&collected) || start.elapsed() > deadline {
            return collected;
        }
    }
}

pub fn wait_connected<S: NetworkSelector>(selector: &mut S, id: &ConnectionId) {
    let collected = poll_until(selector, Vec::new(), Duration::from_secs(5), |c| {
        c.connected.contains(id) || c.disconnected.contains(id)
    });
    assert!(
        collected.connected.contains(id),
        "connection {id} did not become connected: {collected:?}"
    );
}
