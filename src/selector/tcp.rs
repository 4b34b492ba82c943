//! TCP selector implementation.
//!
//! A non-blocking multiplexer built on mio. Every connection carries at most
//! one in-flight send and one in-flight framed receive, and all of them are
//! driven from the single thread that calls `poll`.

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

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use socket2::SockRef;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{channel, Receiver, Sender},
    Arc,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

// Connection sequence numbers start well above this, see `IdGenerator`.
const WAKE_TOKEN: usize = 2;

// Internal channel type for connection records
#[derive(Debug)]
pub(super) struct TcpChannel {
    stream: TcpStream,
    interest: Interest,
}

/// Non-blocking TCP selector.
///
/// Not thread-safe - use [`SelectorInterface`] for cross-thread
/// communication.
pub struct TcpSelector {
    registry: ConnectionRegistry<TcpChannel>,
    ids: Arc<IdGenerator>,
    // Released by `close`, after every channel has been deregistered.
    poll: Option<Poll>,
    waker: Arc<Waker>,
    sender: Sender<SelectorRequest>,
    receiver: Receiver<SelectorRequest>,
    batches: PollBatches,
    // Closed between polls, reported by the next one.
    pending_disconnected: Vec<ConnectionId>,
    settings: SelectorSettings,
    metrics: Arc<dyn NetworkMetrics>,
    clock: Arc<dyn Clock>,
    closed: Arc<AtomicBool>,
}

// ============================================================================
// Constructors
// ============================================================================

impl TcpSelector {
    /// Opens the underlying multiplexer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the operating system refuses to create the
    /// poll instance or its waker.
    pub fn new(
        settings: SelectorSettings,
        metrics: Arc<dyn NetworkMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(WAKE_TOKEN))?);
        let (sender, receiver) = channel();

        Ok(Self {
            registry: ConnectionRegistry::new(),
            ids: Arc::new(IdGenerator::new()),
            poll: Some(poll),
            waker,
            sender,
            receiver,
            batches: PollBatches::default(),
            pending_disconnected: Vec::new(),
            settings,
            metrics,
            clock,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl TcpSelector {
    /// Initiates a connection to the specified address.
    #[instrument(skip(self))]
    pub fn connect(
        &mut self,
        peer_addr: SocketAddr,
        send_buffer_size: usize,
        receive_buffer_size: usize,
        port_type: PortType,
    ) -> Result<ConnectionId, Error> {
        if self.is_closed() {
            return Err(Error::SelectorClosed);
        }

        let stream = open_stream(
            peer_addr,
            send_buffer_size,
            receive_buffer_size,
            self.settings.tcp_nodelay,
        )?;
        let (id, seq) = self.ids.next(peer_addr);
        self.register_channel(id.clone(), seq, peer_addr, port_type, stream)?;

        Ok(id)
    }

    /// Closes a connection by its ID.
    #[instrument(skip(self, id), fields(id = %id))]
    pub fn close_connection(&mut self, id: &ConnectionId) {
        match self.registry.remove(id) {
            Some(mut connection) => {
                deregister(self.poll.as_ref(), &mut connection);
                self.metrics.connection_closed();
                self.pending_disconnected.push(connection.id.clone());
                info!(peer_addr = %connection.peer_addr, "Closed connection");
            }
            None => {
                debug!("Connection not found when closing connection");
            }
        }
    }

    /// Closes all connections.
    #[instrument(skip(self))]
    pub fn close_all_connections(&mut self) {
        for mut connection in self.registry.drain() {
            deregister(self.poll.as_ref(), &mut connection);
            self.metrics.connection_closed();
            info!(id = %connection.id, peer_addr = %connection.peer_addr, "Closed connection");
            self.pending_disconnected.push(connection.id);
        }
    }

    /// Closes every connection, releases the poll instance, and stops
    /// accepting work, including work handed over by interfaces.
    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_all_connections();

        // Channels handed over by interfaces are dropped unregistered, and
        // dropping the receiver makes later hand-overs fail.
        let dropped = self.receiver.try_iter().count();
        if dropped > 0 {
            debug!(dropped, "Dropped queued interface requests");
        }
        let (sender, receiver) = channel();
        self.sender = sender;
        self.receiver = receiver;

        self.poll = None;
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
}

// ============================================================================
// Poll Cycle
// ============================================================================

impl TcpSelector {
    /// Runs one poll cycle. See [`Selector::poll`](super::Selector::poll).
    #[instrument(skip(self, sends), fields(sends = sends.len()))]
    pub fn poll(&mut self, timeout: Duration, sends: Vec<NetworkSend>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::SelectorClosed);
        }
        validate_sends(&self.registry, &sends)?;

        self.batches.reset();
        self.process_interface_requests();
        self.batches
            .disconnected
            .append(&mut self.pending_disconnected);
        self.accept_sends(sends);
        self.expire_stalled_connects();

        let wait = self.bounded_wait(timeout);
        let mut events = Events::with_capacity(self.settings.poll_capacity);
        let select_start = Instant::now();
        let Some(poll) = self.poll.as_mut() else {
            return Err(Error::SelectorClosed);
        };
        match poll.poll(&mut events, Some(wait)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                debug!("Readiness wait interrupted");
            }
            Err(err) => return Err(err.into()),
        }
        self.metrics.select_time(select_start.elapsed());

        let io_start = Instant::now();
        for event in events.iter() {
            let Token(token) = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            // Connections torn down earlier in this cycle have no entry left.
            let Some(id) = self.registry.id_for_seq(token).cloned() else {
                continue;
            };
            if let Err(fault) = self.drive_connection(&id, event) {
                self.fail(&id, fault);
            }
        }
        self.metrics.io_time(io_start.elapsed());

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
}

// ============================================================================
// Utilities
// ============================================================================

impl TcpSelector {
    /// Gets a thread-safe interface for connecting and closing from other
    /// threads.
    pub fn interface(&self) -> SelectorInterface {
        SelectorInterface {
            sender: self.sender.clone(),
            waker: Some(self.waker.clone()),
            ids: self.ids.clone(),
            opener: ChannelOpener::Tcp {
                nodelay: self.settings.tcp_nodelay,
            },
            closed: self.closed.clone(),
        }
    }
}

// ============================================================================
// Internal Cycle Steps
// ============================================================================

impl TcpSelector {
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
                    PendingChannel::Tcp(stream) => {
                        if let Err(err) =
                            self.register_channel(id.clone(), seq, peer_addr, port_type, stream)
                        {
                            error!(id = %id, %peer_addr, ?err, "Failed to register connection");
                            self.pending_disconnected.push(id);
                        }
                    }
                    PendingChannel::Loopback => {
                        error!(id = %id, "Loopback channel handed to TCP selector");
                        self.pending_disconnected.push(id);
                    }
                },
                SelectorRequest::Close { id } => self.close_connection(&id),
                SelectorRequest::CloseAll => self.close_all_connections(),
            }
        }
    }

    fn register_channel(
        &mut self,
        id: ConnectionId,
        seq: usize,
        peer_addr: SocketAddr,
        port_type: PortType,
        mut stream: TcpStream,
    ) -> Result<(), Error> {
        let Some(poll) = self.poll.as_ref() else {
            return Err(Error::SelectorClosed);
        };
        let interest = Interest::WRITABLE;
        poll.registry().register(&mut stream, Token(seq), interest)?;

        info!(id = %id, %peer_addr, %port_type, "Initiating connection");
        self.registry.insert(Connection::new(
            id,
            seq,
            peer_addr,
            port_type,
            TcpChannel { stream, interest },
            self.clock.now(),
        ));
        self.metrics.connection_created();
        Ok(())
    }

    fn accept_sends(&mut self, sends: Vec<NetworkSend>) {
        let Some(poll) = self.poll.as_ref() else {
            return;
        };
        let mut faults = Vec::new();

        for send in sends {
            let id = send.connection_id().clone();
            let Some(connection) = self.registry.get_mut(&id) else {
                warn!(id = %id, "Connection not found when queuing send");
                continue;
            };
            trace!(id = %id, len = send.size_in_bytes(), "Queued send");
            connection.send = Some(send);
            if let Err(err) = update_interest(poll.registry(), connection) {
                faults.push((id, Fault::Io(err)));
            }
        }

        for (id, fault) in faults {
            self.fail(&id, fault);
        }
    }

    fn expire_stalled_connects(&mut self) {
        let now = self.clock.now();
        let limit = self.settings.connect_timeout;
        let Some(deadline) = self.registry.earliest_connect_deadline(limit) else {
            return;
        };
        if deadline > now {
            return;
        }

        for id in self.registry.ids() {
            let Some(connection) = self.registry.get(&id) else {
                continue;
            };
            if connection.state != ConnectionState::Connecting {
                continue;
            }
            let elapsed = now.saturating_sub(connection.connect_started_at);
            if elapsed >= limit {
                self.fail(&id, Fault::ConnectTimeout { elapsed, limit });
            }
        }
    }

    // Caps the wait so a pending connect deadline is not overslept.
    fn bounded_wait(&self, timeout: Duration) -> Duration {
        match self
            .registry
            .earliest_connect_deadline(self.settings.connect_timeout)
        {
            Some(deadline) => timeout.min(deadline.saturating_sub(self.clock.now())),
            None => timeout,
        }
    }

    fn drive_connection(&mut self, id: &ConnectionId, event: &Event) -> Result<(), Fault> {
        let (Some(poll), Some(connection)) = (self.poll.as_ref(), self.registry.get_mut(id)) else {
            return Ok(());
        };

        // mio reports errors alongside readable/writable bits, so error and
        // hang-up events are routed to a read, which surfaces the actual cause.
        let mut readable = event.is_readable() || event.is_error() || event.is_read_closed();
        let mut writable = event.is_writable();

        if connection.state == ConnectionState::Connecting {
            if !(writable || event.is_error() || event.is_write_closed()) {
                return Ok(());
            }
            if !finish_connect(connection)? {
                return Ok(());
            }
            info!(
                id = %id,
                peer_addr = %connection.peer_addr,
                port_type = %connection.port_type,
                "Connection established"
            );
            self.batches.connected.push(id.clone());
            // Interest was WRITABLE only, so data may already be waiting.
            readable = true;
            writable = true;
        }

        if writable {
            if let Some(send) = write_send(connection, self.metrics.as_ref())? {
                debug!(id = %id, len = send.size_in_bytes(), "Send complete");
                self.batches.completed_sends.push(send);
            }
        }

        if readable {
            read_frames(
                connection,
                self.settings.max_frame_size,
                self.clock.as_ref(),
                self.metrics.as_ref(),
                &mut self.batches.completed_receives,
            )?;
        }

        update_interest(poll.registry(), connection).map_err(Fault::Io)
    }

    // Tears a connection down after a fault. Its in-flight send and receive
    // are dropped without being reported.
    fn fail(&mut self, id: &ConnectionId, fault: Fault) {
        let Some(mut connection) = self.registry.remove(id) else {
            return;
        };
        deregister(self.poll.as_ref(), &mut connection);

        let peer_addr = &connection.peer_addr;
        match &fault {
            Fault::EndOfStream => info!(id = %id, %peer_addr, "Connection closed by peer"),
            Fault::ConnectionReset => warn!(id = %id, %peer_addr, "Connection reset"),
            Fault::BrokenPipe => warn!(id = %id, %peer_addr, "Broken pipe"),
            Fault::ConnectFailed(err) if err.kind() == ErrorKind::ConnectionRefused => {
                info!(id = %id, %peer_addr, "Connection refused")
            }
            Fault::FrameSize { .. } | Fault::ConnectTimeout { .. } => {
                warn!(id = %id, %peer_addr, %fault, "Closing faulted connection")
            }
            Fault::ConnectFailed(_) | Fault::Io(_) => {
                error!(id = %id, %peer_addr, %fault, "Closing faulted connection")
            }
        }
        if connection.send.is_some() || connection.receive.is_some() {
            debug!(
                id = %id,
                send_in_flight = connection.send.is_some(),
                receive_in_flight = connection.receive.is_some(),
                "Discarding in-flight operations"
            );
        }

        self.metrics.connection_fault(&fault);
        self.metrics.connection_closed();
        self.batches.disconnected.push(connection.id);
    }
}

// ============================================================================
// Internal Connection I/O
// ============================================================================

// Creates a non-blocking socket and starts connecting. Shared with
// `SelectorInterface`, which opens sockets off the poll thread.
pub(super) fn open_stream(
    peer_addr: SocketAddr,
    send_buffer_size: usize,
    receive_buffer_size: usize,
    nodelay: bool,
) -> Result<TcpStream, Error> {
    let connect_err = |source| Error::Connect {
        addr: peer_addr,
        source,
    };

    let stream = TcpStream::connect(peer_addr).map_err(connect_err)?;
    let socket = SockRef::from(&stream);
    if send_buffer_size > 0 {
        socket
            .set_send_buffer_size(send_buffer_size)
            .map_err(connect_err)?;
    }
    if receive_buffer_size > 0 {
        socket
            .set_recv_buffer_size(receive_buffer_size)
            .map_err(connect_err)?;
    }
    if nodelay {
        stream.set_nodelay(true).map_err(connect_err)?;
    }

    Ok(stream)
}

// Ok(true) once established, Ok(false) on a spurious wakeup.
fn finish_connect(connection: &mut Connection<TcpChannel>) -> Result<bool, Fault> {
    match connection.channel.stream.take_error() {
        Ok(None) => {}
        Ok(Some(err)) | Err(err) => return Err(Fault::ConnectFailed(err)),
    }

    match connection.channel.stream.peer_addr() {
        Ok(_) => {
            connection.state = ConnectionState::Connected;
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotConnected => Ok(false),
        Err(err) => Err(Fault::ConnectFailed(err)),
    }
}

// Advances the in-flight send, returning it once complete.
fn write_send(
    connection: &mut Connection<TcpChannel>,
    metrics: &dyn NetworkMetrics,
) -> Result<Option<NetworkSend>, Fault> {
    let Some(send) = connection.send.as_mut() else {
        return Ok(None);
    };

    let written = send
        .write_to(&mut connection.channel.stream)
        .map_err(Fault::from_io)?;
    if written > 0 {
        trace!(id = %connection.id, len = written, "Wrote to socket");
        metrics.bytes_sent(written as u64);
    }

    if send.is_complete() {
        Ok(connection.send.take())
    } else {
        Ok(None)
    }
}

// Reads until the socket would block, completing as many frames as arrived.
// Bytes past a frame boundary start the next receive.
fn read_frames(
    connection: &mut Connection<TcpChannel>,
    max_frame_size: usize,
    clock: &dyn Clock,
    metrics: &dyn NetworkMetrics,
    completed: &mut Vec<NetworkReceive>,
) -> Result<(), Fault> {
    let id = connection.id.clone();

    loop {
        let receive = connection.receive.get_or_insert_with(|| {
            NetworkReceive::new(id.clone(), FramedReceive::new(max_frame_size), clock.now())
        });

        let read = receive
            .receive_mut()
            .read_from(&mut connection.channel.stream)?;
        if read > 0 {
            trace!(id = %id, len = read, "Read from socket");
            metrics.bytes_received(read as u64);
        }

        if receive.receive().is_complete() {
            if let Some(done) = connection.receive.take() {
                metrics.receive_latency(clock.now().saturating_sub(done.started_at()));
                debug!(id = %id, len = done.frame_length(), "Receive complete");
                completed.push(done);
            }
            continue;
        }

        // Nothing arrived for a fresh receive, so don't keep its start time.
        if receive.receive().is_empty() {
            connection.receive = None;
        }
        return Ok(());
    }
}

fn update_interest(
    registry: &Registry,
    connection: &mut Connection<TcpChannel>,
) -> std::io::Result<()> {
    let interest = match connection.state {
        ConnectionState::Connecting => Interest::WRITABLE,
        _ if connection.send.is_some() => Interest::READABLE | Interest::WRITABLE,
        _ => Interest::READABLE,
    };

    if interest != connection.channel.interest {
        registry.reregister(&mut connection.channel.stream, Token(connection.seq), interest)?;
        connection.channel.interest = interest;
    }
    Ok(())
}

fn deregister(poll: Option<&Poll>, connection: &mut Connection<TcpChannel>) {
    let Some(poll) = poll else {
        return;
    };
    if let Err(err) = poll.registry().deregister(&mut connection.channel.stream) {
        debug!(id = %connection.id, ?err, "Failed to deregister connection");
    }
}

// ============================================================================
// NetworkSelector Trait Implementation
// ============================================================================
//
// Delegates to the inherent methods above.

impl NetworkSelector for TcpSelector {
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
