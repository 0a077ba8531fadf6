use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::xgress::handlers::{CloseHandler, PeekHandler, ReceiveHandler};
use crate::xgress::payload::Payload;
use crate::xgress::xgress::Xgress;

/// Collects all payloads an xgress receives from its peer
pub struct CollectingReceiveHandler {
    payloads: watch::Sender<Vec<Payload>>,
}
impl Default for CollectingReceiveHandler {
    fn default() -> Self {
        CollectingReceiveHandler::new()
    }
}
impl CollectingReceiveHandler {
    pub fn new() -> CollectingReceiveHandler {
        CollectingReceiveHandler {
            payloads: watch::channel(Vec::new()).0,
        }
    }

    pub fn payloads(&self) -> Vec<Payload> {
        self.payloads.borrow().clone()
    }

    /// Waits until at least `n` payloads were received, and returns all received payloads
    pub async fn wait_for(&self, n: usize) -> Vec<Payload> {
        let mut recv = self.payloads.subscribe();
        let result = match recv.wait_for(|payloads| payloads.len() >= n).await {
            Ok(payloads) => payloads.clone(),
            Err(_) => self.payloads.borrow().clone(),
        };
        result
    }
}

#[async_trait]
impl ReceiveHandler for CollectingReceiveHandler {
    async fn handle_xgress_receive(&self, payload: Payload, _x: &Xgress) {
        self.payloads.send_modify(|payloads| payloads.push(payload));
    }
}

pub struct CountingCloseHandler {
    num_closes: watch::Sender<usize>,
}
impl Default for CountingCloseHandler {
    fn default() -> Self {
        CountingCloseHandler::new()
    }
}
impl CountingCloseHandler {
    pub fn new() -> CountingCloseHandler {
        CountingCloseHandler {
            num_closes: watch::channel(0).0,
        }
    }

    pub fn num_closes(&self) -> usize {
        *self.num_closes.borrow()
    }

    pub async fn wait_for_close(&self) {
        let mut recv = self.num_closes.subscribe();
        let _ = recv.wait_for(|&n| n > 0).await;
    }
}
impl CloseHandler for CountingCloseHandler {
    fn handle_xgress_close(&self, _x: &Xgress) {
        self.num_closes.send_modify(|n| *n += 1);
    }
}

/// Records the sequence numbers of payloads passing through an xgress
#[derive(Default)]
pub struct RecordingPeekHandler {
    rx: Mutex<Vec<i32>>,
    tx: Mutex<Vec<i32>>,
    num_closes: Mutex<usize>,
}
impl RecordingPeekHandler {
    pub fn new() -> RecordingPeekHandler {
        Default::default()
    }

    pub fn rx_sequences(&self) -> Vec<i32> {
        self.rx.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn tx_sequences(&self) -> Vec<i32> {
        self.tx.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn num_closes(&self) -> usize {
        self.num_closes.lock().map(|n| *n).unwrap_or_default()
    }
}
impl PeekHandler for RecordingPeekHandler {
    fn rx(&self, _x: &Xgress, payload: &Payload) {
        if let Ok(mut rx) = self.rx.lock() {
            rx.push(payload.sequence);
        }
    }

    fn tx(&self, _x: &Xgress, payload: &Payload) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.push(payload.sequence);
        }
    }

    fn close(&self, _x: &Xgress) {
        if let Ok(mut n) = self.num_closes.lock() {
            *n += 1;
        }
    }
}
