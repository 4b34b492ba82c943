//! Connection identity, per-connection state, and the registry that owns it.

use crate::port::PortType;
use crate::receive::NetworkReceive;
use crate::send::NetworkSend;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// Sequence numbers double as mio tokens, so the low range is kept free for
// internal tokens such as the waker.
const CONNECTION_SEQ_START: usize = 1000;

/// Opaque identifier of a connection.
///
/// Unique for the lifetime of the selector that minted it: the embedded
/// sequence number is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub(crate) fn new(peer_addr: SocketAddr, seq: usize) -> Self {
        Self(format!("{peer_addr}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a connection as seen by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Hands out sequence numbers for connection identifiers.
///
/// Shared between a selector and its interfaces so identifiers minted on
/// other threads never collide with local ones.
#[derive(Debug)]
pub(crate) struct IdGenerator {
    next: AtomicUsize,
}

impl IdGenerator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicUsize::new(CONNECTION_SEQ_START),
        }
    }

    pub(crate) fn next(&self, peer_addr: SocketAddr) -> (ConnectionId, usize) {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        (ConnectionId::new(peer_addr, seq), seq)
    }
}

// Internal per-connection record. `C` is the channel type of the selector
// that owns it.
#[derive(Debug)]
pub(crate) struct Connection<C> {
    pub(crate) id: ConnectionId,
    pub(crate) seq: usize,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) port_type: PortType,
    pub(crate) state: ConnectionState,
    pub(crate) channel: C,
    pub(crate) connect_started_at: Duration,
    pub(crate) send: Option<NetworkSend>,
    pub(crate) receive: Option<NetworkReceive>,
}

impl<C> Connection<C> {
    pub(crate) fn new(
        id: ConnectionId,
        seq: usize,
        peer_addr: SocketAddr,
        port_type: PortType,
        channel: C,
        connect_started_at: Duration,
    ) -> Self {
        Self {
            id,
            seq,
            peer_addr,
            port_type,
            state: ConnectionState::Connecting,
            channel,
            connect_started_at,
            send: None,
            receive: None,
        }
    }
}

// Maps identifiers to connection records, plus a reverse index from sequence
// number for readiness tokens.
#[derive(Debug)]
pub(crate) struct ConnectionRegistry<C> {
    connections: HashMap<ConnectionId, Connection<C>>,
    by_seq: HashMap<usize, ConnectionId>,
}

impl<C> ConnectionRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            connections: HashMap::new(),
            by_seq: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, connection: Connection<C>) {
        self.by_seq.insert(connection.seq, connection.id.clone());
        self.connections.insert(connection.id.clone(), connection);
    }

    pub(crate) fn remove(&mut self, id: &ConnectionId) -> Option<Connection<C>> {
        let connection = self.connections.remove(id)?;
        self.by_seq.remove(&connection.seq);
        Some(connection)
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<&Connection<C>> {
        self.connections.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection<C>> {
        self.connections.get_mut(id)
    }

    pub(crate) fn id_for_seq(&self, seq: usize) -> Option<&ConnectionId> {
        self.by_seq.get(&seq)
    }

    pub(crate) fn has_send_in_flight(&self, id: &ConnectionId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|connection| connection.send.is_some())
    }

    pub(crate) fn state(&self, id: &ConnectionId) -> ConnectionState {
        self.connections
            .get(id)
            .map_or(ConnectionState::Disconnected, |connection| connection.state)
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    // Earliest clock reading at which a still-connecting connection times out.
    pub(crate) fn earliest_connect_deadline(&self, limit: Duration) -> Option<Duration> {
        self.connections
            .values()
            .filter(|connection| connection.state == ConnectionState::Connecting)
            .map(|connection| connection.connect_started_at.saturating_add(limit))
            .min()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Connection<C>> + '_ {
        self.by_seq.clear();
        self.connections.drain().map(|(_, connection)| connection)
    }
}
