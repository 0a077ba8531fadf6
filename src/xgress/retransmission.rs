use std::cmp::min;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::xgress::payload::{Acknowledgement, Address, Originator, Payload};

/// The link from a retransmission buffer into the fabric
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PayloadBufferForwarder: Send + Sync + 'static {
    async fn forward_payload(&self, src_address: &Address, payload: Payload) -> anyhow::Result<()>;
    async fn forward_acknowledgement(&self, src_address: &Address, acknowledgement: Acknowledgement) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct RetransmissionConfig {
    /// A payload that is not acknowledged this long after it was sent is sent again. This is the
    ///  initial value, it doubles with every retransmission of the same payload up to
    ///  `max_retransmit_backoff`.
    pub retransmit_after: Duration,
    pub max_retransmit_backoff: Duration,

    /// Acknowledgements for received payloads are collected and sent in batches: a batch is sent
    ///  when it reaches `ack_count` entries, or when the oldest unsent entry is `ack_period` old,
    ///  whichever comes first.
    pub ack_period: Duration,
    pub ack_count: usize,

    /// Granularity for checking retransmission deadlines and the ack period
    pub tick_interval: Duration,

    /// The maximum number of unacknowledged payloads. When this is reached, buffering further
    ///  payloads waits until acknowledgements free up space, which in turn stops the xgress from
    ///  reading its peer.
    pub max_buffered: usize,
}
impl Default for RetransmissionConfig {
    fn default() -> Self {
        RetransmissionConfig {
            retransmit_after: Duration::from_millis(2000),
            max_retransmit_backoff: Duration::from_secs(30),
            ack_period: Duration::from_millis(1000),
            ack_count: 96,
            tick_interval: Duration::from_millis(100),
            max_buffered: 1024,
        }
    }
}
impl RetransmissionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_after.is_zero() {
            bail!("retransmit_after must be positive");
        }
        if self.max_retransmit_backoff < self.retransmit_after {
            bail!("max_retransmit_backoff must be at least retransmit_after");
        }
        if self.ack_count == 0 {
            bail!("ack_count must be positive");
        }
        if self.tick_interval.is_zero() {
            bail!("tick_interval must be positive");
        }
        if self.max_buffered == 0 {
            bail!("max_buffered must be positive");
        }
        Ok(())
    }
}

struct UnackedPayload {
    payload: Payload,
    retransmit_at: Instant,
    backoff: Duration,
}

struct PayloadBufferInner {
    config: Arc<RetransmissionConfig>,
    forwarder: Arc<dyn PayloadBufferForwarder>,
    circuit_id: String,
    src_address: Address,
    originator: Originator,

    /// payloads sent into the fabric and not acknowledged yet
    unacked: BTreeMap<i32, UnackedPayload>,
    /// payloads received from the fabric, with the acknowledgement not sent yet
    acked: BTreeSet<i32>,
    last_ack: Instant,
}
impl PayloadBufferInner {
    fn has_capacity(&self) -> bool {
        self.unacked.len() < self.config.max_buffered
    }

    fn buffer_payload(&mut self, payload: Payload) {
        if payload.circuit_id != self.circuit_id {
            warn!("[c/{}] not buffering payload for unrelated circuit {}", self.circuit_id, payload.circuit_id);
            return;
        }
        if payload.is_circuit_end() {
            trace!("[c/{}] not buffering end of circuit payload", self.circuit_id);
            return;
        }

        trace!("[c/{}] buffered #{}", self.circuit_id, payload.sequence);
        self.unacked.insert(payload.sequence, UnackedPayload {
            payload,
            retransmit_at: Instant::now() + self.config.retransmit_after,
            backoff: self.config.retransmit_after,
        });
    }

    fn acknowledge_payload(&mut self, sequence: i32) {
        trace!("[c/{}] acknowledge #{}", self.circuit_id, sequence);
        self.acked.insert(sequence);
    }

    fn receive_acknowledgement(&mut self, ack: Acknowledgement) {
        if ack.circuit_id != self.circuit_id {
            warn!("[c/{}] ignoring acknowledgement for unrelated circuit {}", self.circuit_id, ack.circuit_id);
            return;
        }

        for sequence in ack.sequence {
            if self.unacked.remove(&sequence).is_some() {
                trace!("[c/{}] acknowledged #{}", self.circuit_id, sequence);
            }
        }
    }

    async fn send_acknowledgement_if_due(&mut self) {
        if self.acked.is_empty() {
            // nothing to acknowledge, so the period starts with the next entry
            self.last_ack = Instant::now();
            return;
        }
        if self.acked.len() < self.config.ack_count && self.last_ack.elapsed() < self.config.ack_period {
            return;
        }

        let mut ack = Acknowledgement::new(&self.circuit_id, self.originator);
        ack.sequence = std::mem::take(&mut self.acked).into_iter().collect();
        debug!("[c/{}] acknowledging {} payloads, {} buffered", self.circuit_id, ack.sequence.len(), self.unacked.len());

        if let Err(e) = self.forwarder.forward_acknowledgement(&self.src_address, ack).await {
            warn!("[c/{}] error forwarding acknowledgement: {}", self.circuit_id, e);
        }
        self.last_ack = Instant::now();
    }

    async fn retransmit(&mut self) {
        let now = Instant::now();
        let max_backoff = self.config.max_retransmit_backoff;

        let mut due = Vec::new();
        for entry in self.unacked.values_mut() {
            if entry.retransmit_at <= now {
                entry.backoff = min(entry.backoff * 2, max_backoff);
                entry.retransmit_at = now + entry.backoff;
                due.push(entry.payload.clone());
            }
        }

        if due.is_empty() {
            return;
        }

        let num_due = due.len();
        for payload in due {
            if let Err(e) = self.forwarder.forward_payload(&self.src_address, payload).await {
                warn!("[c/{}] error retransmitting payload: {}", self.circuit_id, e);
            }
        }
        info!("[c/{}] retransmitted {} payloads, {} buffered", self.circuit_id, num_due, self.unacked.len());
    }
}

/// Keeps payloads sent into the fabric until they are acknowledged, retransmitting them if they
///  are not acknowledged in time, and batches acknowledgements for payloads received from the
///  fabric.
///
/// The state is owned by a spawned loop, the API hands work to it through channels.
pub struct PayloadBuffer {
    circuit_id: String,
    buffered_send: mpsc::Sender<Payload>,
    acknowledged_send: mpsc::Sender<i32>,
    received_ack_send: mpsc::Sender<Acknowledgement>,
    closed: AtomicBool,
    active_handle: JoinHandle<()>,
}
impl Drop for PayloadBuffer {
    fn drop(&mut self) {
        self.active_handle.abort();
    }
}
impl PayloadBuffer {
    /// NB: This spawns the buffer's loop, so it must be called in the context of a Tokio runtime
    pub fn new(
        config: Arc<RetransmissionConfig>,
        forwarder: Arc<dyn PayloadBufferForwarder>,
        circuit_id: &str,
        src_address: Address,
        originator: Originator,
    ) -> anyhow::Result<PayloadBuffer> {
        config.validate()?;

        let (buffered_send, buffered_recv) = mpsc::channel(1);
        let (acknowledged_send, acknowledged_recv) = mpsc::channel(config.ack_count);
        let (received_ack_send, received_ack_recv) = mpsc::channel(16);

        let inner = PayloadBufferInner {
            config: config.clone(),
            forwarder,
            circuit_id: circuit_id.to_string(),
            src_address,
            originator,
            unacked: Default::default(),
            acked: Default::default(),
            last_ack: Instant::now(),
        };

        let active_handle = tokio::spawn(Self::do_loop(config, inner, buffered_recv, acknowledged_recv, received_ack_recv));

        Ok(PayloadBuffer {
            circuit_id: circuit_id.to_string(),
            buffered_send,
            acknowledged_send,
            received_ack_send,
            closed: AtomicBool::new(false),
            active_handle,
        })
    }

    pub fn circuit_id(&self) -> &str {
        &self.circuit_id
    }

    /// Track a payload sent into the fabric. This waits while the buffer is full.
    pub async fn buffer_payload(&self, payload: Payload) {
        let sequence = payload.sequence;
        if self.buffered_send.send(payload).await.is_err() {
            debug!("[c/{}] buffer is closed, not buffering #{}", self.circuit_id, sequence);
        }
    }

    /// Mark a payload received from the fabric for inclusion in the next acknowledgement
    pub async fn acknowledge_payload(&self, sequence: i32) {
        if self.acknowledged_send.send(sequence).await.is_err() {
            debug!("[c/{}] buffer is closed, not acknowledging #{}", self.circuit_id, sequence);
        }
    }

    pub async fn receive_acknowledgement(&self, acknowledgement: Acknowledgement) {
        if self.received_ack_send.send(acknowledgement).await.is_err() {
            debug!("[c/{}] buffer is closed, ignoring acknowledgement", self.circuit_id);
        }
    }

    /// Stops retransmission and releases all buffered payloads. This is idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            trace!("[c/{}] buffer already closed", self.circuit_id);
            return;
        }
        debug!("[c/{}] closing buffer", self.circuit_id);
        self.active_handle.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn do_loop(
        config: Arc<RetransmissionConfig>,
        mut inner: PayloadBufferInner,
        mut buffered_recv: mpsc::Receiver<Payload>,
        mut acknowledged_recv: mpsc::Receiver<i32>,
        mut received_ack_recv: mpsc::Receiver<Acknowledgement>,
    ) {
        debug!("[c/{}] payload buffer started", inner.circuit_id);

        let mut tick = interval(config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                payload = buffered_recv.recv(), if inner.has_capacity() => match payload {
                    Some(payload) => inner.buffer_payload(payload),
                    None => break,
                },
                sequence = acknowledged_recv.recv() => match sequence {
                    Some(sequence) => {
                        inner.acknowledge_payload(sequence);
                        inner.send_acknowledgement_if_due().await;
                    }
                    None => break,
                },
                ack = received_ack_recv.recv() => match ack {
                    Some(ack) => inner.receive_acknowledgement(ack),
                    None => break,
                },
                _ = tick.tick() => {
                    inner.send_acknowledgement_if_due().await;
                    inner.retransmit().await;
                }
            }
        }

        debug!("[c/{}] payload buffer exited", inner.circuit_id);
    }
}

/// Shares retransmission buffers between the xgress instances of a circuit that have the same
///  fabric address, and disposes of them when the circuit ends.
///
/// A buffer that was closed (e.g. because the xgress using it closed) is replaced by a fresh one
///  the next time it is asked for.
pub struct PayloadBufferController {
    config: Arc<RetransmissionConfig>,
    forwarder: Arc<dyn PayloadBufferForwarder>,
    buffers: RwLock<FxHashMap<(String, Address), Arc<PayloadBuffer>>>,
}
impl PayloadBufferController {
    pub fn new(config: Arc<RetransmissionConfig>, forwarder: Arc<dyn PayloadBufferForwarder>) -> anyhow::Result<PayloadBufferController> {
        config.validate()?;

        Ok(PayloadBufferController {
            config,
            forwarder,
            buffers: Default::default(),
        })
    }

    pub async fn buffer_for_circuit(&self, circuit_id: &str, address: &Address, originator: Originator) -> anyhow::Result<Arc<PayloadBuffer>> {
        let key = (circuit_id.to_string(), address.clone());
        if let Some(buffer) = self.buffers.read().await.get(&key) {
            if !buffer.is_closed() {
                return Ok(buffer.clone());
            }
        }

        let mut buffers = self.buffers.write().await;
        if let Some(buffer) = buffers.get(&key) {
            if !buffer.is_closed() {
                return Ok(buffer.clone());
            }
            debug!("[c/{}] replacing closed payload buffer for {}", circuit_id, address);
        }

        debug!("[c/{}] new payload buffer for {}", circuit_id, address);
        let buffer = Arc::new(PayloadBuffer::new(self.config.clone(), self.forwarder.clone(), circuit_id, address.clone(), originator)?);
        buffers.insert(key, buffer.clone());
        Ok(buffer)
    }

    pub async fn end_circuit(&self, circuit_id: &str) {
        let mut buffers = self.buffers.write().await;
        buffers.retain(|(c, address), buffer| {
            if c == circuit_id {
                debug!("[c/{}] removing payload buffer for {}", circuit_id, address);
                buffer.close();
                false
            }
            else {
                true
            }
        });
    }

    pub async fn num_buffers(&self) -> usize {
        self.buffers.read().await.len()
    }
}
