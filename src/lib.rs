//! netmux - non-blocking, multiplexed network I/O for a routing tier
//!
//! A [`Selector`] drives many outbound TCP connections from one thread. Each
//! call to [`Selector::poll`] hands over a batch of sends, waits a bounded
//! time for readiness, pushes and pulls as many bytes as the sockets allow,
//! and reassembles `[u32 big-endian length][payload]` frames. The results of
//! a cycle are drained through four accessors: connected, disconnected,
//! completed sends, and completed receives.
//!
//! Payloads are opaque. Connection failures never surface as errors from
//! `poll`; they appear as identifiers in [`Selector::disconnected`].

// Internal-only modules
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod metrics;
pub(crate) mod port;
pub(crate) mod receive;
pub(crate) mod selector;
pub(crate) mod send;
pub(crate) mod time;

// These are the intended public API
pub use crate::config::{
    SelectorSettings, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_SIZE, DEFAULT_POLL_CAPACITY,
};
pub use connection::{ConnectionId, ConnectionState};
pub use error::{Error, Fault};
pub use metrics::{InMemoryMetrics, MetricsSnapshot, NetworkMetrics, NoopMetrics};
pub use port::PortType;
pub use receive::{FramedReceive, NetworkReceive, ReceiveState};
pub use selector::{LoopbackSelector, NetworkSelector, Selector, SelectorInterface, TcpSelector};
pub use send::{ByteBufferSend, NetworkSend, SendUnit};
pub use time::{Clock, ManualClock, SystemClock};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::connection::{ConnectionId, ConnectionState};
    pub use crate::error::{Error, Fault};
    pub use crate::metrics::{InMemoryMetrics, NetworkMetrics, NoopMetrics};
    pub use crate::port::PortType;
    pub use crate::receive::{FramedReceive, NetworkReceive};
    pub use crate::selector::{NetworkSelector, Selector, SelectorInterface};
    pub use crate::send::{ByteBufferSend, NetworkSend, SendUnit};
    pub use crate::time::{Clock, ManualClock, SystemClock};
}
