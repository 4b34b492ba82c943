use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// The error type for netmux operations.
///
/// Only caller contract violations and setup failures are reported this way.
/// Anything that goes wrong on an individual connection after it has been
/// registered is a [`Fault`] and shows up as a disconnect instead.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system, e.g. while creating the
    /// multiplexer itself.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// The outbound socket for a connection attempt could not be created.
    ///
    /// No connection is registered when this is returned.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The selector has been closed and no longer accepts work.
    #[error("Selector is closed")]
    SelectorClosed,

    // ============================================================================
    // Caller Contract Violations
    // ============================================================================

    /// A send was submitted for a connection that already has one in flight,
    /// or the same connection appeared twice in one batch of sends.
    ///
    /// The whole batch is rejected before anything is applied.
    #[error("Connection {id} already has a send in flight")]
    DuplicateSend {
        /// The connection the duplicate send was addressed to.
        id: String,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for the `selector_type` configuration key.
    #[error("Invalid selector type '{got}', expected one of: {}", .valid.join(", "))]
    InvalidSelectorType { got: String, valid: Vec<String> },
}

/// A per-connection fault.
///
/// Faults never escape [`Selector::poll`](crate::Selector::poll). The selector
/// tears the connection down, discards its in-flight send and receive, and
/// reports its identifier in the next disconnected batch.
#[derive(Error, Debug)]
pub enum Fault {
    /// The peer declared a frame length outside `0..=max`.
    #[error("Declared frame size {size} exceeds maximum {max}")]
    FrameSize { size: u64, max: usize },

    /// The peer closed the stream.
    #[error("Unexpected end of stream")]
    EndOfStream,

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("Broken pipe")]
    BrokenPipe,

    /// The asynchronous connection attempt was rejected.
    #[error("Connection establishment failed: {0}")]
    ConnectFailed(std::io::Error),

    /// The connection stayed in the connecting state for too long.
    #[error("Connection attempt timed out after {elapsed:?} (limit {limit:?})")]
    ConnectTimeout { elapsed: Duration, limit: Duration },

    /// Any other channel error.
    #[error("Channel error: {0}")]
    Io(std::io::Error),
}

impl Fault {
    /// Classifies an I/O error raised while reading from or writing to a
    /// connected channel.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                Fault::ConnectionReset
            }
            std::io::ErrorKind::BrokenPipe => Fault::BrokenPipe,
            std::io::ErrorKind::UnexpectedEof => Fault::EndOfStream,
            _ => Fault::Io(err),
        }
    }

    /// True for faults raised by a misbehaving peer rather than the network.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, Fault::FrameSize { .. })
    }
}
