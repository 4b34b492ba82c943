//! In-memory selector.
//!
//! Connections are established instantly and every send is echoed back as a
//! completed receive once it has been fully written. Nothing touches the
//! network, which makes it a stand-in for [`TcpSelector`](super::TcpSelector)
//! when testing the layers above.

use super::batches::PollBatches;
use super::interface::{ChannelOpener, PendingChannel, SelectorRequest};
use super::{validate_sends, NetworkSelector, SelectorInterface};
use crate::config::SelectorSettings;
use crate::connection::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionState, IdGenerator,
};
use crate::error::{Error, Fault};
use crate::metrics::NetworkMetrics;
use crate::port::PortType;
use crate::receive::{FramedReceive, NetworkReceive};
use crate::send::NetworkSend;
use crate::time::Clock;

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{channel, Receiver, Sender},
    Arc,
};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// Echoing in-memory selector.
///
/// The poll timeout is ignored; a poll never blocks. A send that stops making
/// progress stays in flight and is resumed by the next poll.
pub struct LoopbackSelector {
    // The channel of a loopback connection holds the bytes written so far by
    // its in-flight send.
    registry: ConnectionRegistry<Vec<u8>>,
    ids: Arc<IdGenerator>,
    sender: Sender<SelectorRequest>,
    receiver: Receiver<SelectorRequest>,
    batches: PollBatches,
    pending_connected: Vec<ConnectionId>,
    pending_disconnected: Vec<ConnectionId>,
    settings: SelectorSettings,
    metrics: Arc<dyn NetworkMetrics>,
    clock: Arc<dyn Clock>,
    closed: Arc<AtomicBool>,
}

impl LoopbackSelector {
    pub fn new(
        settings: SelectorSettings,
        metrics: Arc<dyn NetworkMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (sender, receiver) = channel();
        Self {
            registry: ConnectionRegistry::new(),
            ids: Arc::new(IdGenerator::new()),
            sender,
            receiver,
            batches: PollBatches::default(),
            pending_connected: Vec::new(),
            pending_disconnected: Vec::new(),
            settings,
            metrics,
            clock,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Records the connection and reports it connected after the next poll.
    #[instrument(skip(self))]
    pub fn connect(
        &mut self,
        peer_addr: SocketAddr,
        _send_buffer_size: usize,
        _receive_buffer_size: usize,
        port_type: PortType,
    ) -> Result<ConnectionId, Error> {
        if self.is_closed() {
            return Err(Error::SelectorClosed);
        }
        let (id, seq) = self.ids.next(peer_addr);
        self.register(id.clone(), seq, peer_addr, port_type);
        Ok(id)
    }

    #[instrument(skip(self, id), fields(id = %id))]
    pub fn close_connection(&mut self, id: &ConnectionId) {
        if self.registry.remove(id).is_some() {
            self.metrics.connection_closed();
            self.pending_disconnected.push(id.clone());
            info!("Closed connection");
        } else {
            debug!("Connection not found when closing connection");
        }
    }

    #[instrument(skip(self))]
    pub fn close_all_connections(&mut self) {
        for connection in self.registry.drain() {
            self.metrics.connection_closed();
            info!(id = %connection.id, peer_addr = %connection.peer_addr, "Closed connection");
            self.pending_disconnected.push(connection.id);
        }
    }

    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_all_connections();

        let dropped = self.receiver.try_iter().count();
        if dropped > 0 {
            debug!(dropped, "Dropped queued interface requests");
        }
        let (sender, receiver) = channel();
        self.sender = sender;
        self.receiver = receiver;

        self.pending_connected.clear();
        self.pending_disconnected.clear();
        self.batches.reset();
        info!("Selector closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connection_state(&self, id: &ConnectionId) -> ConnectionState {
        self.registry.state(id)
    }

    pub fn port_type(&self, id: &ConnectionId) -> Option<PortType> {
        self.registry.get(id).map(|connection| connection.port_type)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Advances every in-flight send and turns each one that completes into
    /// a completed receive carrying the written bytes.
    #[instrument(skip(self, sends), fields(sends = sends.len()))]
    pub fn poll(&mut self, _timeout: Duration, sends: Vec<NetworkSend>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::SelectorClosed);
        }
        validate_sends(&self.registry, &sends)?;

        self.batches.reset();
        self.process_interface_requests();
        self.batches.connected.append(&mut self.pending_connected);
        self.batches
            .disconnected
            .append(&mut self.pending_disconnected);

        self.accept_sends(sends);

        let mut in_flight: Vec<ConnectionId> = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| self.registry.has_send_in_flight(id))
            .collect();
        in_flight.sort();
        for id in in_flight {
            self.echo(&id);
        }

        debug!(
            connected = self.batches.connected.len(),
            disconnected = self.batches.disconnected.len(),
            completed_sends = self.batches.completed_sends.len(),
            completed_receives = self.batches.completed_receives.len(),
            "Poll cycle complete"
        );
        Ok(())
    }

    pub fn connected(&mut self) -> Vec<ConnectionId> {
        self.batches.take_connected()
    }

    pub fn disconnected(&mut self) -> Vec<ConnectionId> {
        self.batches.take_disconnected()
    }

    pub fn completed_sends(&mut self) -> Vec<NetworkSend> {
        self.batches.take_completed_sends()
    }

    pub fn completed_receives(&mut self) -> Vec<NetworkReceive> {
        self.batches.take_completed_receives()
    }

    pub fn interface(&self) -> SelectorInterface {
        SelectorInterface {
            sender: self.sender.clone(),
            waker: None,
            ids: self.ids.clone(),
            opener: ChannelOpener::Loopback,
            closed: self.closed.clone(),
        }
    }

    fn register(&mut self, id: ConnectionId, seq: usize, peer_addr: SocketAddr, port_type: PortType) {
        let mut connection = Connection::new(
            id.clone(),
            seq,
            peer_addr,
            port_type,
            Vec::new(),
            self.clock.now(),
        );
        connection.state = ConnectionState::Connected;
        self.registry.insert(connection);
        self.metrics.connection_created();
        self.pending_connected.push(id);
    }

    fn process_interface_requests(&mut self) {
        let requests: Vec<SelectorRequest> = self.receiver.try_iter().collect();

        for request in requests {
            match request {
                SelectorRequest::Register {
                    id,
                    seq,
                    peer_addr,
                    port_type,
                    channel,
                } => match channel {
                    PendingChannel::Loopback => self.register(id, seq, peer_addr, port_type),
                    PendingChannel::Tcp(_) => {
                        warn!(id = %id, "TCP channel handed to loopback selector");
                        self.pending_disconnected.push(id);
                    }
                },
                SelectorRequest::Close { id } => self.close_connection(&id),
                SelectorRequest::CloseAll => self.close_all_connections(),
            }
        }
    }

    fn accept_sends(&mut self, sends: Vec<NetworkSend>) {
        for send in sends {
            let id = send.connection_id().clone();
            match self.registry.get_mut(&id) {
                Some(connection) => connection.send = Some(send),
                None => warn!(id = %id, "Connection not found when queuing send"),
            }
        }
    }

    // Writes until the send completes or stops making progress. Only a
    // complete send is echoed.
    fn echo(&mut self, id: &ConnectionId) {
        let Some(connection) = self.registry.get_mut(id) else {
            return;
        };
        let Some(send) = connection.send.as_mut() else {
            return;
        };

        while !send.is_complete() {
            match send.write_to(&mut connection.channel) {
                Ok(0) => break,
                Ok(written) => self.metrics.bytes_sent(written as u64),
                Err(err) => {
                    self.fail(id, Fault::from_io(err));
                    return;
                }
            }
        }
        if !send.is_complete() {
            trace!(id = %id, written = connection.channel.len(), "Send still in flight");
            return;
        }

        let Some(send) = connection.send.take() else {
            return;
        };
        let echoed = std::mem::take(&mut connection.channel);

        let started_at = self.clock.now();
        let mut frame = Vec::with_capacity(4 + echoed.len());
        let len = u32::try_from(echoed.len()).unwrap_or(u32::MAX);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&echoed);

        let mut receive = FramedReceive::new(self.settings.max_frame_size);
        match receive.read_from(&mut Cursor::new(frame)) {
            Ok(read) if receive.is_complete() => {
                self.metrics.bytes_received(read as u64);
                self.metrics
                    .receive_latency(self.clock.now().saturating_sub(started_at));
                self.batches.completed_sends.push(send);
                self.batches
                    .completed_receives
                    .push(NetworkReceive::new(id.clone(), receive, started_at));
            }
            Ok(_) => self.fail(id, Fault::EndOfStream),
            Err(fault) => self.fail(id, fault),
        }
    }

    fn fail(&mut self, id: &ConnectionId, fault: Fault) {
        if self.registry.remove(id).is_none() {
            return;
        }
        warn!(id = %id, %fault, "Closing faulted connection");
        self.metrics.connection_fault(&fault);
        self.metrics.connection_closed();
        self.batches.disconnected.push(id.clone());
    }
}

// ============================================================================
// NetworkSelector Trait Implementation
// ============================================================================

impl NetworkSelector for LoopbackSelector {
    fn connect(
        &mut self,
        addr: SocketAddr,
        send_buffer_size: usize,
        receive_buffer_size: usize,
        port_type: PortType,
    ) -> Result<ConnectionId, Error> {
        self.connect(addr, send_buffer_size, receive_buffer_size, port_type)
    }

    fn close_connection(&mut self, id: &ConnectionId) {
        self.close_connection(id)
    }

    fn close_all_connections(&mut self) {
        self.close_all_connections()
    }

    fn close(&mut self) {
        self.close()
    }

    fn connection_state(&self, id: &ConnectionId) -> ConnectionState {
        self.connection_state(id)
    }

    fn port_type(&self, id: &ConnectionId) -> Option<PortType> {
        self.port_type(id)
    }

    fn connection_count(&self) -> usize {
        self.connection_count()
    }

    fn poll(&mut self, timeout: Duration, sends: Vec<NetworkSend>) -> Result<(), Error> {
        self.poll(timeout, sends)
    }

    fn connected(&mut self) -> Vec<ConnectionId> {
        self.connected()
    }

    fn disconnected(&mut self) -> Vec<ConnectionId> {
        self.disconnected()
    }

    fn completed_sends(&mut self) -> Vec<NetworkSend> {
        self.completed_sends()
    }

    fn completed_receives(&mut self) -> Vec<NetworkReceive> {
        self.completed_receives()
    }

    fn interface(&self) -> SelectorInterface {
        self.interface()
    }
}
