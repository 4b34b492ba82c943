//! Selector layer: one thread multiplexing many framed byte streams.
//!
//! [`Selector`] is what callers hold. It boxes a [`NetworkSelector`], picked
//! by configuration: the mio-backed [`TcpSelector`] or the in-memory
//! [`LoopbackSelector`] that echoes every send back as a receive.

mod batches;
mod interface;
mod loopback;
mod tcp;

pub use interface::SelectorInterface;
pub use loopback::LoopbackSelector;
pub use tcp::TcpSelector;

use crate::config::{get_namespaced_string, SelectorSettings};
use crate::connection::{ConnectionId, ConnectionRegistry, ConnectionState};
use crate::error::Error;
use crate::metrics::NetworkMetrics;
use crate::port::PortType;
use crate::receive::NetworkReceive;
use crate::send::NetworkSend;
use crate::time::Clock;
use config::Config;
use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// The multiplexer contract shared by every selector implementation.
///
/// All methods are called from the single thread that drives [`poll`]. Other
/// threads go through [`SelectorInterface`].
///
/// [`poll`]: NetworkSelector::poll
pub trait NetworkSelector: Send {
    // ============================================================================
    // Connection Management
    // ============================================================================

    // Takes a resolved SocketAddr rather than ToSocketAddrs so the trait stays
    // dyn-compatible. Selector::connect does the resolution.
    fn connect(
        &mut self,
        addr: SocketAddr,
        send_buffer_size: usize,
        receive_buffer_size: usize,
        port_type: PortType,
    ) -> Result<ConnectionId, Error>;

    fn close_connection(&mut self, id: &ConnectionId);
    fn close_all_connections(&mut self);
    fn close(&mut self);

    fn connection_state(&self, id: &ConnectionId) -> ConnectionState;
    fn port_type(&self, id: &ConnectionId) -> Option<PortType>;
    fn connection_count(&self) -> usize;

    // ============================================================================
    // Poll Cycle
    // ============================================================================

    fn poll(&mut self, timeout: Duration, sends: Vec<NetworkSend>) -> Result<(), Error>;

    fn connected(&mut self) -> Vec<ConnectionId>;
    fn disconnected(&mut self) -> Vec<ConnectionId>;
    fn completed_sends(&mut self) -> Vec<NetworkSend>;
    fn completed_receives(&mut self) -> Vec<NetworkReceive>;

    // ============================================================================
    // Utilities
    // ============================================================================

    fn interface(&self) -> SelectorInterface;
}

/// Configuration-selected selector.
///
/// # Configuration Keys
///
/// - `selector_type`: Either "tcp" or "loopback" (defaults to "tcp")
/// - `max_frame_size`, `poll_capacity`, `connect_timeout_ms`, `tcp_nodelay`
///   (see [`SelectorSettings`])
///
/// # Example
///
/// ```toml
/// selector_type = "tcp"
/// max_frame_size = 1048576
/// connect_timeout_ms = 5000
/// ```
pub struct Selector {
    inner: Box<dyn NetworkSelector>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Selector {
    /// Creates a selector from the top level of `config`.
    pub fn new(
        config: &Config,
        metrics: Arc<dyn NetworkMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        Self::new_named(config, "", metrics, clock)
    }

    /// Creates a selector with configuration namespacing.
    ///
    /// Configuration lookup follows this priority:
    /// 1. `{name}.{key}` (e.g., `replica_pool.selector_type`)
    /// 2. `{key}` (e.g., `selector_type`)
    /// 3. Hard-coded default
    ///
    /// # Example
    ///
    /// ```toml
    /// # Global defaults
    /// max_frame_size = 1048576
    ///
    /// # Specific to the "replica_pool" instance
    /// [replica_pool]
    /// connect_timeout_ms = 2000
    /// ```
    pub fn new_named(
        config: &Config,
        name: &str,
        metrics: Arc<dyn NetworkMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let selector_type = match get_namespaced_string(config, name, "selector_type") {
            Ok(selector_type) => selector_type,
            Err(config::ConfigError::NotFound(_)) => "tcp".to_string(),
            Err(err) => return Err(err.into()),
        };
        let settings = SelectorSettings::from_config_named(config, name)?;

        let inner: Box<dyn NetworkSelector> = match selector_type.as_str() {
            "tcp" => Box::new(TcpSelector::new(settings, metrics, clock)?),
            "loopback" => Box::new(LoopbackSelector::new(settings, metrics, clock)),
            _ => {
                return Err(Error::InvalidSelectorType {
                    got: selector_type,
                    valid: vec!["tcp".to_string(), "loopback".to_string()],
                });
            }
        };

        Ok(Self { inner })
    }

    /// Wraps any [`NetworkSelector`] implementation.
    pub fn from_impl(inner: Box<dyn NetworkSelector>) -> Self {
        Self { inner }
    }

    // ============================================================================
    // Connection Management
    // ============================================================================

    /// Starts a non-blocking connection attempt and returns its identifier.
    ///
    /// **Not thread-safe.** For multi-threaded use, call this method on
    /// [`SelectorInterface`] instead.
    ///
    /// Returns as soon as the socket exists. The identifier shows up in
    /// [`Self::connected`] once the connection is established, or in
    /// [`Self::disconnected`] if the attempt fails or times out.
    ///
    /// A buffer size of 0 leaves the operating system default in place.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAddress`] if `addr` does not resolve, and
    /// [`Error::Connect`] if the socket cannot be created. Nothing is
    /// registered in either case.
    pub fn connect<A: ToSocketAddrs>(
        &mut self,
        addr: A,
        send_buffer_size: usize,
        receive_buffer_size: usize,
        port_type: PortType,
    ) -> Result<ConnectionId, Error> {
        let addr = resolve(addr)?;
        self.inner
            .connect(addr, send_buffer_size, receive_buffer_size, port_type)
    }

    /// Closes a connection by its identifier.
    ///
    /// **Not thread-safe.** For multi-threaded use, call this method on
    /// [`SelectorInterface`] instead.
    ///
    /// Any in-flight send or receive is discarded and the identifier is
    /// reported by [`Self::disconnected`] after the next poll. Unknown
    /// identifiers are ignored, because the connection might have failed
    /// already.
    pub fn close_connection(&mut self, id: &ConnectionId) {
        self.inner.close_connection(id)
    }

    /// Closes every live connection. Each one is reported disconnected after
    /// the next poll.
    pub fn close_all_connections(&mut self) {
        self.inner.close_all_connections()
    }

    /// Releases all multiplexing resources.
    ///
    /// Subsequent accessors return empty batches and [`Self::poll`] fails with
    /// [`Error::SelectorClosed`]. Interfaces handed out earlier refuse new
    /// connections with the same error and drop close requests.
    pub fn close(&mut self) {
        self.inner.close()
    }

    /// [`ConnectionState::Disconnected`] for identifiers that are not live.
    pub fn connection_state(&self, id: &ConnectionId) -> ConnectionState {
        self.inner.connection_state(id)
    }

    pub fn port_type(&self, id: &ConnectionId) -> Option<PortType> {
        self.inner.port_type(id)
    }

    /// Number of live connections, connecting or connected.
    pub fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }

    // ============================================================================
    // Poll Cycle
    // ============================================================================

    /// Runs one poll cycle.
    ///
    /// Accepts `sends` as the in-flight send of their target connections,
    /// waits at most `timeout` for readiness, and drives partial writes and
    /// reads. Results are collected through the four batch accessors, which
    /// must be drained every cycle: the next poll starts fresh batches.
    ///
    /// Sends to unknown connections are dropped. Per-connection faults never
    /// surface here; they turn into disconnects.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateSend`] if a target already has a send in flight or
    ///   appears twice in `sends`. Nothing is applied and the previous batches
    ///   stay untouched.
    /// - [`Error::SelectorClosed`] after [`Self::close`].
    /// - [`Error::Io`] if the readiness wait itself fails.
    pub fn poll(&mut self, timeout: Duration, sends: Vec<NetworkSend>) -> Result<(), Error> {
        self.inner.poll(timeout, sends)
    }

    /// Identifiers that finished connecting during the last poll.
    pub fn connected(&mut self) -> Vec<ConnectionId> {
        self.inner.connected()
    }

    /// Identifiers torn down during or before the last poll. Their in-flight
    /// sends and receives are lost.
    pub fn disconnected(&mut self) -> Vec<ConnectionId> {
        self.inner.disconnected()
    }

    /// Sends fully written during the last poll.
    pub fn completed_sends(&mut self) -> Vec<NetworkSend> {
        self.inner.completed_sends()
    }

    /// Frames fully reassembled during the last poll, in stream order per
    /// connection.
    pub fn completed_receives(&mut self) -> Vec<NetworkReceive> {
        self.inner.completed_receives()
    }

    // ============================================================================
    // Utilities
    // ============================================================================

    /// Gets a thread-safe handle for connecting and closing from other
    /// threads.
    pub fn interface(&self) -> SelectorInterface {
        self.inner.interface()
    }
}

pub(crate) fn resolve<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr, Error> {
    addr.to_socket_addrs()
        .map_err(|_| Error::InvalidAddress)?
        .next()
        .ok_or(Error::InvalidAddress)
}

// Rejects the whole batch if any target already has a send in flight or is
// addressed twice.
pub(crate) fn validate_sends<C>(
    registry: &ConnectionRegistry<C>,
    sends: &[NetworkSend],
) -> Result<(), Error> {
    let mut seen = HashSet::with_capacity(sends.len());
    for send in sends {
        let id = send.connection_id();
        if registry.has_send_in_flight(id) || !seen.insert(id) {
            return Err(Error::DuplicateSend {
                id: id.to_string(),
            });
        }
    }
    Ok(())
}
