use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::util::random::{Random, RngRandom};
use crate::xgress::connection::Connection;
use crate::xgress::handlers::{CloseHandler, PeekHandler, ReceiveHandler};
use crate::xgress::options::Options;
use crate::xgress::payload::{Acknowledgement, Address, Headers, Originator, Payload};
use crate::xgress::retransmission::PayloadBuffer;
use crate::xgress::transmit_buffer::TransmitBuffer;

/// The result of handing a payload to an xgress for delivery to its peer
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendOutcome {
    Queued,
    /// The xgress is closed (or closing), and the payload was discarded
    AlreadyClosed,
}

struct XgressInner {
    circuit_id: String,
    address: Address,
    peer: Arc<dyn Connection>,
    originator: Originator,
    options: Options,
    label: String,

    tx_send: RwLock<Option<mpsc::Sender<Payload>>>,
    tx_recv: Mutex<Option<mpsc::Receiver<Payload>>>,
    tx_buffer: Mutex<TransmitBuffer>,
    rx_sequence: AtomicI32,

    receive_handler: RwLock<Option<Arc<dyn ReceiveHandler>>>,
    close_handler: RwLock<Option<Arc<dyn CloseHandler>>>,
    peek_handlers: RwLock<Vec<Arc<dyn PeekHandler>>>,
    payload_buffer: RwLock<Option<Arc<PayloadBuffer>>>,

    started: AtomicBool,
    closed: AtomicBool,
    closed_send: watch::Sender<bool>,
    random: Arc<dyn Random>,
}

/// One endpoint of a circuit, bridging a local peer connection to the circuit's payload stream.
///
/// Once started, an xgress runs two loops: the *rx* loop reads from the peer, assigns sequence
///  numbers and hands the resulting payloads to the receive handler, and the *tx* loop takes
///  payloads from the fabric (see [Xgress::send_payload]), restores their order and writes them
///  to the peer. Handing a payload to the tx loop waits until the loop is ready to take it, so a
///  slow peer slows down the fabric's delivery to it.
///
/// This is a cheap handle, clones refer to the same xgress.
#[derive(Clone)]
pub struct Xgress {
    inner: Arc<XgressInner>,
}
impl Xgress {
    pub fn new(circuit_id: &str, address: Address, peer: Arc<dyn Connection>, originator: Originator, options: Options) -> Xgress {
        Self::new_with_random(circuit_id, address, peer, originator, options, Arc::new(RngRandom {}))
    }

    pub fn new_with_random(circuit_id: &str, address: Address, peer: Arc<dyn Connection>, originator: Originator, options: Options, random: Arc<dyn Random>) -> Xgress {
        let label = format!("{{c/{}|@/{}}}<{}>", circuit_id, address, originator);
        let (tx_send, tx_recv) = mpsc::channel(1);
        let (closed_send, _) = watch::channel(false);

        Xgress {
            inner: Arc::new(XgressInner {
                circuit_id: circuit_id.to_string(),
                address,
                peer,
                originator,
                options,
                label,
                tx_send: RwLock::new(Some(tx_send)),
                tx_recv: Mutex::new(Some(tx_recv)),
                tx_buffer: Mutex::new(TransmitBuffer::default()),
                rx_sequence: AtomicI32::new(0),
                receive_handler: Default::default(),
                close_handler: Default::default(),
                peek_handlers: Default::default(),
                payload_buffer: Default::default(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                closed_send,
                random,
            })
        }
    }

    pub fn circuit_id(&self) -> &str {
        &self.inner.circuit_id
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn originator(&self) -> Originator {
        self.inner.originator
    }

    pub fn is_terminator(&self) -> bool {
        self.inner.originator == Originator::Terminator
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Identifies this xgress in log output
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The sequence number the next payload read from the peer will get
    pub fn rx_sequence(&self) -> i32 {
        self.inner.rx_sequence.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn set_receive_handler(&self, receive_handler: Arc<dyn ReceiveHandler>) {
        *self.inner.receive_handler.write().await = Some(receive_handler);
    }

    pub async fn set_close_handler(&self, close_handler: Arc<dyn CloseHandler>) {
        *self.inner.close_handler.write().await = Some(close_handler);
    }

    pub async fn add_peek_handler(&self, peek_handler: Arc<dyn PeekHandler>) {
        self.inner.peek_handlers.write().await.push(peek_handler);
    }

    pub async fn set_payload_buffer(&self, payload_buffer: Arc<PayloadBuffer>) {
        *self.inner.payload_buffer.write().await = Some(payload_buffer);
    }

    /// Spawns the rx and tx loops. Starting an xgress more than once has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            warn!("{} already started", self.label());
            return;
        }

        tokio::spawn(self.clone().rx_loop());

        let x = self.clone();
        tokio::spawn(async move {
            let tx_recv = x.inner.tx_recv.lock().await.take();
            match tx_recv {
                Some(tx_recv) => x.tx_loop(tx_recv).await,
                None => error!("{} tx queue is gone", x.label()),
            }
        });
    }

    /// A payload signalling the end of the circuit to the other side, with the next sequence
    ///  number from this xgress's peer direction. Once sequence numbers are exhausted, this uses
    ///  `i32::MAX`, which is never assigned to data.
    pub fn end_of_circuit_payload(&self) -> Payload {
        let sequence = self.next_rx_sequence().unwrap_or(i32::MAX);
        Payload::end_of_circuit(&self.inner.circuit_id, sequence, self.inner.originator)
    }

    /// Hand a payload that arrived from the fabric to this xgress for delivery to its peer. This
    ///  waits until the tx loop takes the payload, or until the xgress is closed.
    pub async fn send_payload(&self, payload: Payload) -> SendOutcome {
        if payload.is_circuit_end() {
            info!("{} received end of circuit payload", self.label());
        }

        if self.is_closed() {
            debug!("{} closed, discarding payload #{}", self.label(), payload.sequence);
            return SendOutcome::AlreadyClosed;
        }

        let tx_send = match self.inner.tx_send.read().await.clone() {
            Some(tx_send) => tx_send,
            None => return SendOutcome::AlreadyClosed,
        };

        trace!("{} queuing #{} to tx queue", self.label(), payload.sequence);
        let mut closed_recv = self.inner.closed_send.subscribe();
        select! {
            result = tx_send.send(payload) => match result {
                Ok(_) => SendOutcome::Queued,
                Err(e) => {
                    debug!("{} tx loop is gone, discarding payload #{}", self.label(), e.0.sequence);
                    SendOutcome::AlreadyClosed
                }
            },
            _ = closed_recv.wait_for(|&closed| closed) => {
                debug!("{} closed while queuing payload", self.label());
                SendOutcome::AlreadyClosed
            }
        }
    }

    /// Pass an acknowledgement from the other side of the circuit to the retransmission buffer.
    ///
    /// NB: This returns without waiting for the buffer to process the acknowledgement. Both sides
    ///      of a circuit can live in the same process and share a buffer, and waiting here could
    ///      then deadlock with the call chain that produced the acknowledgement.
    pub async fn send_acknowledgement(&self, acknowledgement: Acknowledgement) {
        if !self.inner.options.retransmission {
            return;
        }

        if let Some(payload_buffer) = self.inner.payload_buffer.read().await.clone() {
            tokio::spawn(async move {
                payload_buffer.receive_acknowledgement(acknowledgement).await;
            });
        }
    }

    /// Close after the given time, regardless of traffic
    pub fn close_timeout(&self, duration: Duration) {
        let x = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            debug!("{} close timeout of {:?} elapsed", x.label(), duration);
            x.close().await;
        });
    }

    /// Closes the peer connection and releases all resources. Only the first call has any effect,
    ///  so this can safely be called from several places concurrently.
    pub async fn close(&self) {
        if self.inner.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!("{} already closed, skipping close", self.label());
            return;
        }

        debug!("{} closing xgress peer", self.label());
        if let Err(e) = self.inner.peer.close().await {
            warn!("{} error while closing xgress peer {}: {}", self.label(), self.inner.peer.log_context(), e);
        }

        self.inner.closed_send.send_replace(true);

        debug!("{} closing tx queue", self.label());
        self.inner.tx_send.write().await.take();

        if self.inner.options.retransmission {
            if let Some(payload_buffer) = self.inner.payload_buffer.read().await.as_ref() {
                payload_buffer.close();
            }
        }

        let peek_handlers = self.inner.peek_handlers.read().await.clone();
        for peek_handler in &peek_handlers {
            peek_handler.close(self);
        }

        let close_handler = self.inner.close_handler.read().await.clone();
        match close_handler {
            Some(close_handler) => close_handler.handle_xgress_close(self),
            None => warn!("{} no close handler", self.label()),
        }
    }

    /// A circuit carries at most `i32::MAX` payloads per direction, `None` when they are used up
    fn next_rx_sequence(&self) -> Option<i32> {
        self.inner.rx_sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| s.checked_add(1))
            .ok()
    }

    async fn rx_loop(self) {
        debug!("{} rx started", self.label());

        loop {
            let read = match self.inner.peer.read_payload().await {
                Ok(read) => read,
                Err(e) => {
                    if self.is_closed() {
                        debug!("{} read failed after close: {}", self.label(), e);
                    }
                    else {
                        warn!("{} read failed: {}", self.label(), e);
                    }
                    break;
                }
            };
            trace!("{} read: {} bytes", self.label(), read.data.len());

            if read.is_terminal() {
                debug!("{} EOF, exiting rx loop", self.label());
                break;
            }
            if self.is_closed() {
                break;
            }

            if !read.data.is_empty() {
                match self.next_rx_sequence() {
                    Some(sequence) => self.on_rx(sequence, read.data, read.headers).await,
                    None => {
                        warn!("{} rx sequence numbers exhausted, closing", self.label());
                        break;
                    }
                }
            }

            if read.eof {
                debug!("{} EOF after final read, exiting rx loop", self.label());
                break;
            }
        }

        self.close().await;
        debug!("{} rx exited", self.label());
    }

    async fn on_rx(&self, sequence: i32, data: Bytes, headers: Headers) {
        let num_bytes = data.len();
        let payload = Payload::new(&self.inner.circuit_id, sequence, self.inner.originator, data, headers);

        // buffer before anything else sees the payload: nothing goes into the fabric untracked
        if self.inner.options.retransmission {
            let payload_buffer = self.inner.payload_buffer.read().await.clone();
            if let Some(payload_buffer) = payload_buffer {
                trace!("{} buffering payload #{}", self.label(), payload.sequence);
                payload_buffer.buffer_payload(payload.clone()).await;
            }
        }

        let peek_handlers = self.inner.peek_handlers.read().await.clone();
        for peek_handler in &peek_handlers {
            peek_handler.rx(self, &payload);
        }

        let sequence = payload.sequence;
        let receive_handler = self.inner.receive_handler.read().await.clone();
        match receive_handler {
            Some(receive_handler) => receive_handler.handle_xgress_receive(payload, self).await,
            None => warn!("{} no receive handler, discarding payload #{}", self.label(), sequence),
        }

        debug!("{} received #{} ({} bytes)", self.label(), sequence, num_bytes);
    }

    async fn tx_loop(self, mut tx_recv: mpsc::Receiver<Payload>) {
        debug!("{} tx started", self.label());

        let mut closed_recv = self.inner.closed_send.subscribe();
        loop {
            let payload = select! {
                payload = tx_recv.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
                _ = closed_recv.wait_for(|&closed| closed) => break,
            };

            if payload.is_circuit_end() {
                debug!("{} end of circuit, exiting tx loop", self.label());
                break;
            }

            if let Err(e) = self.on_tx(payload).await {
                warn!("{} write failed: {}", self.label(), e);
                self.close().await;
                break;
            }
        }

        debug!("{} tx exited", self.label());
    }

    fn should_drop(&self) -> bool {
        let options = &self.inner.options;
        options.random_drops && (options.drop_1_in_n <= 1 || self.inner.random.gen_i32_range(0..options.drop_1_in_n) == 0)
    }

    async fn on_tx(&self, payload: Payload) -> anyhow::Result<()> {
        if self.should_drop() {
            error!("{} drop! #{}", self.label(), payload.sequence);
            return Ok(());
        }

        let sequence = payload.sequence;
        let (outcome, ready) = {
            let mut tx_buffer = self.inner.tx_buffer.lock().await;
            let outcome = tx_buffer.receive_unordered(payload);
            (outcome, tx_buffer.ready_for_transmit())
        };
        trace!("{} #{}: {:?}", self.label(), sequence, outcome);

        if self.inner.options.retransmission && outcome.is_acknowledgeable() {
            let payload_buffer = self.inner.payload_buffer.read().await.clone();
            if let Some(payload_buffer) = payload_buffer {
                trace!("{} acknowledging #{}", self.label(), sequence);
                payload_buffer.acknowledge_payload(sequence).await;
            }
        }

        if ready.is_empty() {
            trace!("{} queued transmit of #{}", self.label(), sequence);
            return Ok(());
        }

        let peek_handlers = self.inner.peek_handlers.read().await.clone();
        for out in ready {
            for peek_handler in &peek_handlers {
                peek_handler.tx(self, &out);
            }

            let Payload { sequence, data, headers, .. } = out;
            let n = self.inner.peer.write_payload(data, headers).await?;
            debug!("{} sent #{} ({} bytes)", self.label(), sequence, n);
        }
        Ok(())
    }
}
