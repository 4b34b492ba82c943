use crate::connection::ConnectionId;
use crate::receive::NetworkReceive;
use crate::send::NetworkSend;
use std::mem;

// The four per-cycle result lists. Accessors hand out the current vector and
// leave an empty one behind, so a batch is never seen twice.
#[derive(Debug, Default)]
pub(super) struct PollBatches {
    pub(super) connected: Vec<ConnectionId>,
    pub(super) disconnected: Vec<ConnectionId>,
    pub(super) completed_sends: Vec<NetworkSend>,
    pub(super) completed_receives: Vec<NetworkReceive>,
}

impl PollBatches {
    pub(super) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(super) fn take_connected(&mut self) -> Vec<ConnectionId> {
        mem::take(&mut self.connected)
    }

    pub(super) fn take_disconnected(&mut self) -> Vec<ConnectionId> {
        mem::take(&mut self.disconnected)
    }

    pub(super) fn take_completed_sends(&mut self) -> Vec<NetworkSend> {
        mem::take(&mut self.completed_sends)
    }

    pub(super) fn take_completed_receives(&mut self) -> Vec<NetworkReceive> {
        mem::take(&mut self.completed_receives)
    }
}
