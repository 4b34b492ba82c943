use super::resolve;
use super::tcp::open_stream;
use crate::connection::{ConnectionId, IdGenerator};
use crate::error::Error;
use crate::port::PortType;
use mio::net::TcpStream;
use mio::Waker;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc::Sender, Arc};
use tracing::{debug, info, warn};

// A channel opened off the poll thread, waiting to be registered.
#[derive(Debug)]
pub(crate) enum PendingChannel {
    Tcp(TcpStream),
    Loopback,
}

// Internal request type for cross-thread communication. Applied at the start
// of the next poll cycle, in the order they were sent.
#[derive(Debug)]
pub(crate) enum SelectorRequest {
    Register {
        id: ConnectionId,
        seq: usize,
        peer_addr: SocketAddr,
        port_type: PortType,
        channel: PendingChannel,
    },
    Close {
        id: ConnectionId,
    },
    CloseAll,
}

// How an interface opens channels for the selector it belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ChannelOpener {
    Tcp { nodelay: bool },
    Loopback,
}

/// Thread-safe handle to a selector.
///
/// Obtain one with [`Selector::interface()`](super::Selector::interface).
/// Clones can be used from any number of threads while another thread drives
/// `poll`.
#[derive(Debug, Clone)]
pub struct SelectorInterface {
    pub(crate) sender: Sender<SelectorRequest>,
    pub(crate) waker: Option<Arc<Waker>>,
    pub(crate) ids: Arc<IdGenerator>,
    pub(crate) opener: ChannelOpener,
    // Set once by the selector's `close`.
    pub(crate) closed: Arc<AtomicBool>,
}

impl SelectorInterface {
    /// Starts a non-blocking connection attempt and returns its identifier.
    ///
    /// The socket is created on the calling thread, so address and socket
    /// errors are returned right here. The connection is handed to the
    /// selector and registered at the start of its next poll cycle.
    ///
    /// **Note:** If thread-safety is not required, call
    /// `Selector::connect()` directly.
    ///
    /// # Errors
    ///
    /// [`Error::SelectorClosed`] once the selector has been closed. No socket
    /// is opened in that case.
    pub fn connect<A: ToSocketAddrs>(
        &self,
        addr: A,
        send_buffer_size: usize,
        receive_buffer_size: usize,
        port_type: PortType,
    ) -> Result<ConnectionId, Error> {
        if self.is_closed() {
            return Err(Error::SelectorClosed);
        }
        let peer_addr = resolve(addr)?;
        let channel = match self.opener {
            ChannelOpener::Tcp { nodelay } => PendingChannel::Tcp(open_stream(
                peer_addr,
                send_buffer_size,
                receive_buffer_size,
                nodelay,
            )?),
            ChannelOpener::Loopback => PendingChannel::Loopback,
        };

        let (id, seq) = self.ids.next(peer_addr);
        self.sender
            .send(SelectorRequest::Register {
                id: id.clone(),
                seq,
                peer_addr,
                port_type,
                channel,
            })
            .map_err(|_| Error::SelectorClosed)?;
        self.wakeup();

        info!(id = %id, %peer_addr, %port_type, "Handed connection to selector");
        Ok(id)
    }

    /// Queues a connection to be closed.
    ///
    /// This is non-blocking. The connection is closed at the start of the
    /// next poll cycle and reported disconnected by that cycle.
    pub fn close(&self, id: &ConnectionId) {
        self.request(SelectorRequest::Close { id: id.clone() });
    }

    /// Queues every connection to be closed.
    pub fn close_all(&self) {
        self.request(SelectorRequest::CloseAll);
    }

    /// Interrupts a blocking readiness wait so the selector picks up queued
    /// work right away.
    pub fn wakeup(&self) {
        if let Some(waker) = &self.waker {
            if let Err(err) = waker.wake() {
                warn!(?err, "Failed to wake selector");
            }
        }
    }

    /// True once the selector behind this handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn request(&self, request: SelectorRequest) {
        if self.is_closed() {
            debug!("Selector is closed, dropping request");
            return;
        }
        if self.sender.send(request).is_err() {
            warn!("Selector is gone, dropping request");
            return;
        }
        self.wakeup();
    }
}
