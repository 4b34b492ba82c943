//! Incremental reassembly of length-prefixed frames.
//!
//! Wire format: `[u32 big-endian length N][N bytes payload]`. A frame is
//! accumulated across as many partial reads as the channel hands out. The
//! payload buffer is allocated only once the full length prefix is known, and
//! a declared length above the configured maximum is a protocol fault.

use crate::connection::ConnectionId;
use crate::error::Fault;
use std::io::{ErrorKind, Read};
use std::time::Duration;
use tracing::trace;

const SIZE_PREFIX_LEN: usize = 4;

/// Where a [`FramedReceive`] is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    AwaitingLength,
    AwaitingPayload,
    Complete,
}

/// Accumulates exactly one length-prefixed frame.
#[derive(Debug, Clone)]
pub struct FramedReceive {
    size_buf: [u8; SIZE_PREFIX_LEN],
    size_filled: usize,
    // Allocated once the length prefix is complete.
    payload: Option<Vec<u8>>,
    payload_filled: usize,
    max_frame_size: usize,
}

impl FramedReceive {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            size_buf: [0; SIZE_PREFIX_LEN],
            size_filled: 0,
            payload: None,
            payload_filled: 0,
            max_frame_size,
        }
    }

    pub fn state(&self) -> ReceiveState {
        match &self.payload {
            None => ReceiveState::AwaitingLength,
            Some(buf) if self.payload_filled < buf.len() => ReceiveState::AwaitingPayload,
            Some(_) => ReceiveState::Complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state() == ReceiveState::Complete
    }

    /// True until the first byte of the frame has arrived.
    pub fn is_empty(&self) -> bool {
        self.size_filled == 0
    }

    /// Bytes consumed from the channel so far, prefix included.
    pub fn bytes_read(&self) -> usize {
        self.size_filled + self.payload_filled
    }

    /// Declared payload length, once the prefix has been read.
    pub fn frame_length(&self) -> Option<usize> {
        self.payload.as_ref().map(Vec::len)
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// The reassembled payload. `None` until the frame is complete.
    pub fn payload(&self) -> Option<&[u8]> {
        if self.is_complete() {
            self.payload.as_deref()
        } else {
            None
        }
    }

    pub fn into_payload(self) -> Option<Vec<u8>> {
        if self.is_complete() {
            self.payload
        } else {
            None
        }
    }

    /// Reads from `channel` until the frame is complete or the channel would
    /// block, and returns how many bytes were consumed.
    ///
    /// Never reads past the end of the current frame, so bytes belonging to
    /// the next frame stay in the channel. Calling this on a complete frame
    /// reads nothing.
    ///
    /// # Errors
    ///
    /// - [`Fault::FrameSize`] if the declared length exceeds the maximum
    /// - [`Fault::EndOfStream`] if the channel reports end of stream
    /// - any other channel error, classified with [`Fault::from_io`]
    pub fn read_from<R: Read + ?Sized>(&mut self, channel: &mut R) -> Result<usize, Fault> {
        let mut read = 0;

        while self.size_filled < SIZE_PREFIX_LEN {
            match read_some(channel, &mut self.size_buf[self.size_filled..])? {
                Some(sz) => {
                    self.size_filled += sz;
                    read += sz;
                }
                None => return Ok(read),
            }
        }

        if self.payload.is_none() {
            let size = u32::from_be_bytes(self.size_buf);
            let size = usize::try_from(size).unwrap_or(usize::MAX);
            if size > self.max_frame_size {
                return Err(Fault::FrameSize {
                    size: size as u64,
                    max: self.max_frame_size,
                });
            }
            trace!(size, "Read frame length");
            self.payload = Some(vec![0; size]);
        }

        if let Some(payload) = self.payload.as_mut() {
            while self.payload_filled < payload.len() {
                match read_some(channel, &mut payload[self.payload_filled..])? {
                    Some(sz) => {
                        self.payload_filled += sz;
                        read += sz;
                    }
                    None => break,
                }
            }
        }

        Ok(read)
    }
}

// `Ok(None)` means the channel would block.
fn read_some<R: Read + ?Sized>(channel: &mut R, buf: &mut [u8]) -> Result<Option<usize>, Fault> {
    loop {
        match channel.read(buf) {
            Ok(0) => return Err(Fault::EndOfStream),
            Ok(sz) => return Ok(Some(sz)),
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(Fault::from_io(err)),
        }
    }
}

/// A [`FramedReceive`] in progress on, or completed from, a connection.
#[derive(Debug, Clone)]
pub struct NetworkReceive {
    connection_id: ConnectionId,
    receive: FramedReceive,
    started_at: Duration,
}

impl NetworkReceive {
    pub fn new(connection_id: ConnectionId, receive: FramedReceive, started_at: Duration) -> Self {
        Self {
            connection_id,
            receive,
            started_at,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn receive(&self) -> &FramedReceive {
        &self.receive
    }

    pub(crate) fn receive_mut(&mut self) -> &mut FramedReceive {
        &mut self.receive
    }

    /// Clock reading taken when the receive was started.
    pub fn started_at(&self) -> Duration {
        self.started_at
    }

    /// The reassembled payload. Empty for a zero-length frame, and for a
    /// receive that has not completed yet.
    pub fn payload(&self) -> &[u8] {
        self.receive.payload().unwrap_or(&[])
    }

    pub fn frame_length(&self) -> usize {
        self.receive.frame_length().unwrap_or(0)
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.receive.into_payload().unwrap_or_default()
    }
}
