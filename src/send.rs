//! Resumable outbound payloads.

use crate::connection::ConnectionId;
use std::fmt::Debug;
use std::io::{ErrorKind, Write};
use tracing::trace;

/// A payload that can be pushed to a non-blocking channel a piece at a time.
///
/// Implementations must be resumable: every call to [`write_to`] continues
/// exactly where the previous one stopped.
///
/// [`write_to`]: SendUnit::write_to
pub trait SendUnit: Send + Debug {
    /// Writes as many bytes as the channel accepts without blocking and
    /// returns how many were written.
    ///
    /// Returns `Ok(0)` when the channel is momentarily unwritable. Any other
    /// error is a channel fault.
    fn write_to(&mut self, channel: &mut dyn Write) -> std::io::Result<usize>;

    /// True once every byte has been written.
    fn is_complete(&self) -> bool;

    /// Total payload size, fixed at construction.
    fn size_in_bytes(&self) -> u64;
}

/// A [`SendUnit`] backed by an owned byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteBufferSend {
    buf: Vec<u8>,
    pos: usize,
}

impl ByteBufferSend {
    /// Sends `buf` verbatim.
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }

    /// Sends `payload` behind a 4-byte big-endian length prefix, the same
    /// framing the receive side expects.
    ///
    /// # Panics
    ///
    /// Panics if `payload` is longer than `u32::MAX` bytes.
    pub fn framed(payload: &[u8]) -> Self {
        let len = u32::try_from(payload.len()).expect("frame payload exceeds u32::MAX bytes");
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
        Self::new(buf)
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl SendUnit for ByteBufferSend {
    fn write_to(&mut self, channel: &mut dyn Write) -> std::io::Result<usize> {
        let mut written = 0;
        while self.pos < self.buf.len() {
            match channel.write(&self.buf[self.pos..]) {
                Ok(0) => break,
                Ok(sz) => {
                    self.pos += sz;
                    written += sz;
                    trace!(len = sz, remaining = self.buf.len() - self.pos, "Wrote to channel");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    fn is_complete(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn size_in_bytes(&self) -> u64 {
        self.buf.len() as u64
    }
}

/// A [`SendUnit`] addressed to a connection.
///
/// Owned by the selector from the moment it is accepted by `poll` until it is
/// handed back through `completed_sends`, or dropped when its connection goes
/// away.
#[derive(Debug)]
pub struct NetworkSend {
    connection_id: ConnectionId,
    payload: Box<dyn SendUnit>,
}

impl NetworkSend {
    pub fn new(connection_id: ConnectionId, payload: Box<dyn SendUnit>) -> Self {
        Self {
            connection_id,
            payload,
        }
    }

    /// Convenience for sending a raw byte buffer.
    pub fn from_bytes(connection_id: ConnectionId, buf: Vec<u8>) -> Self {
        Self::new(connection_id, Box::new(ByteBufferSend::new(buf)))
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn payload(&self) -> &dyn SendUnit {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Box<dyn SendUnit> {
        self.payload
    }

    pub(crate) fn write_to(&mut self, channel: &mut dyn Write) -> std::io::Result<usize> {
        self.payload.write_to(channel)
    }

    pub fn is_complete(&self) -> bool {
        self.payload.is_complete()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.payload.size_in_bytes()
    }
}
