use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::trace;

use crate::xgress::connection::{Connection, ReadPayload};
use crate::xgress::payload::Headers;

const CHANNEL_CAPACITY: usize = 64;

/// One end of an in-memory connection: payloads written to it can be read from the other end.
///
/// Closing one end makes pending and future reads on both ends return end-of-stream.
pub struct MemoryConnection {
    name: String,
    inbound: Mutex<mpsc::Receiver<(Bytes, Headers)>>,
    outbound: RwLock<Option<mpsc::Sender<(Bytes, Headers)>>>,
    closed_send: watch::Sender<bool>,
    fail_writes: AtomicBool,
    num_writes: AtomicUsize,
    num_closes: AtomicUsize,
}
impl MemoryConnection {
    fn new(name: &str, inbound: mpsc::Receiver<(Bytes, Headers)>, outbound: mpsc::Sender<(Bytes, Headers)>) -> MemoryConnection {
        MemoryConnection {
            name: name.to_string(),
            inbound: Mutex::new(inbound),
            outbound: RwLock::new(Some(outbound)),
            closed_send: watch::channel(false).0,
            fail_writes: AtomicBool::new(false),
            num_writes: AtomicUsize::new(0),
            num_closes: AtomicUsize::new(0),
        }
    }

    /// Make all subsequent writes fail, simulating a broken connection
    pub fn set_fail_writes(&self, fail_writes: bool) {
        self.fail_writes.store(fail_writes, Ordering::Release);
    }

    /// the number of successful writes
    pub fn num_writes(&self) -> usize {
        self.num_writes.load(Ordering::Acquire)
    }

    /// the number of calls to `close()`, including redundant calls
    pub fn num_closes(&self) -> usize {
        self.num_closes.load(Ordering::Acquire)
    }
}

pub fn memory_connection_pair() -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
    let (a_send, a_recv) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_send, b_recv) = mpsc::channel(CHANNEL_CAPACITY);

    (
        Arc::new(MemoryConnection::new("a", a_recv, b_send)),
        Arc::new(MemoryConnection::new("b", b_recv, a_send)),
    )
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn read_payload(&self) -> anyhow::Result<ReadPayload> {
        let mut closed_recv = self.closed_send.subscribe();
        if *closed_recv.borrow() {
            return Ok(ReadPayload::eof());
        }

        let mut inbound = self.inbound.lock().await;
        select! {
            received = inbound.recv() => match received {
                Some((data, headers)) => Ok(ReadPayload::data(data, headers)),
                None => Ok(ReadPayload::eof()),
            },
            _ = closed_recv.wait_for(|&closed| closed) => Ok(ReadPayload::eof()),
        }
    }

    async fn write_payload(&self, data: Bytes, headers: Headers) -> anyhow::Result<usize> {
        if self.fail_writes.load(Ordering::Acquire) {
            bail!("{}: write failure", self.name);
        }

        let outbound = match self.outbound.read().await.clone() {
            Some(outbound) => outbound,
            None => bail!("{}: connection is closed", self.name),
        };

        let len = data.len();
        if outbound.send((data, headers)).await.is_err() {
            bail!("{}: other end is closed", self.name);
        }
        self.num_writes.fetch_add(1, Ordering::AcqRel);
        Ok(len)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.num_closes.fetch_add(1, Ordering::AcqRel);
        trace!("closing memory connection {}", self.name);

        self.closed_send.send_replace(true);
        self.outbound.write().await.take();
        Ok(())
    }

    fn log_context(&self) -> String {
        format!("memory:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair() {
        let (a, b) = memory_connection_pair();

        assert_eq!(a.write_payload(Bytes::from_static(b"hello"), Default::default()).await.unwrap(), 5);
        let read = b.read_payload().await.unwrap();
        assert_eq!(read.data, Bytes::from_static(b"hello"));
        assert!(!read.eof);

        a.close().await.unwrap();
        assert!(a.read_payload().await.unwrap().is_terminal());
        assert!(b.read_payload().await.unwrap().is_terminal());
        assert!(a.write_payload(Bytes::from_static(b"x"), Default::default()).await.is_err());
        assert_eq!(a.num_writes(), 1);
        assert_eq!(a.num_closes(), 1);
        assert_eq!(a.log_context(), "memory:a");
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (a, _b) = memory_connection_pair();

        let a2 = a.clone();
        let pending = tokio::spawn(async move { a2.read_payload().await });
        tokio::task::yield_now().await;

        a.close().await.unwrap();
        assert!(pending.await.unwrap().unwrap().is_terminal());
    }
}
