use std::collections::BTreeMap;

use tracing::trace;

use crate::xgress::payload::Payload;

/// Upper bound for the number of sequence numbers the buffer accepts ahead of the last delivered
///  payload. Payloads beyond this window are rejected without being buffered.
pub const DEFAULT_MAX_WINDOW: i32 = 4096;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// The payload is buffered for delivery in order
    Accepted,
    /// The payload was delivered before (or is otherwise behind the delivery point) and was dropped
    Stale,
    /// The payload is too far ahead of the delivery point. It was neither buffered nor should it
    ///  be acknowledged, so the sender's retransmission delivers it again later.
    OutsideWindow,
}
impl ReceiveOutcome {
    pub fn is_acknowledgeable(&self) -> bool {
        !matches!(self, ReceiveOutcome::OutsideWindow)
    }
}

/// Turns payloads arriving in arbitrary order into a gapless, ordered stream.
///
/// Sequence numbers are not expected to wrap: once `i32::MAX` is delivered, everything is stale.
pub struct TransmitBuffer {
    buffer: BTreeMap<i32, Payload>,
    last_delivered: i32,
    max_window: i32,
}
impl Default for TransmitBuffer {
    fn default() -> Self {
        TransmitBuffer::new(DEFAULT_MAX_WINDOW)
    }
}
impl TransmitBuffer {
    pub fn new(max_window: i32) -> TransmitBuffer {
        TransmitBuffer {
            buffer: Default::default(),
            last_delivered: -1,
            max_window,
        }
    }

    pub fn receive_unordered(&mut self, payload: Payload) -> ReceiveOutcome {
        if payload.sequence <= self.last_delivered {
            trace!("dropping stale payload #{}, last delivered is #{}", payload.sequence, self.last_delivered);
            return ReceiveOutcome::Stale;
        }
        if payload.sequence as i64 > self.last_delivered as i64 + self.max_window as i64 {
            trace!("rejecting payload #{} outside the receive window ending at #{}", payload.sequence, self.last_delivered as i64 + self.max_window as i64);
            return ReceiveOutcome::OutsideWindow;
        }

        self.buffer.insert(payload.sequence, payload);
        ReceiveOutcome::Accepted
    }

    /// Removes and returns the longest gapless run of payloads following the last delivered one
    pub fn ready_for_transmit(&mut self) -> Vec<Payload> {
        let mut result = Vec::new();

        while let Some(entry) = self.buffer.first_entry() {
            match self.last_delivered.checked_add(1) {
                Some(next) if *entry.key() == next => {
                    result.push(entry.remove());
                    self.last_delivered = next;
                }
                _ => break,
            }
        }
        result
    }

    pub fn last_delivered(&self) -> i32 {
        self.last_delivered
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
