use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::xgress::payload::Headers;

/// The result of a single read from a peer connection.
///
/// A read can return data *and* hit end-of-stream in the same call. The data is still valid and
///  must be processed, `eof` tells the reader that there will be nothing after it.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReadPayload {
    pub data: Bytes,
    pub headers: Headers,
    pub eof: bool,
}
impl ReadPayload {
    pub fn data(data: Bytes, headers: Headers) -> ReadPayload {
        ReadPayload {
            data,
            headers,
            eof: false,
        }
    }

    pub fn eof() -> ReadPayload {
        ReadPayload {
            data: Bytes::new(),
            headers: Default::default(),
            eof: true,
        }
    }

    /// Nothing more will be read from the connection, and this read did not yield anything either
    pub fn is_terminal(&self) -> bool {
        self.eof && self.data.is_empty()
    }
}

/// A local peer connection as provided by a transport binding, framing the peer's byte stream
///  into payloads.
///
/// Implementations must allow `close()` to be called while a `read_payload()` call is pending,
///  and that pending read must then return promptly (with an error or end-of-stream).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn read_payload(&self) -> anyhow::Result<ReadPayload>;

    /// returns the number of bytes written
    async fn write_payload(&self, data: Bytes, headers: Headers) -> anyhow::Result<usize>;

    async fn close(&self) -> anyhow::Result<()>;

    /// context for log messages, typically the peer's address
    fn log_context(&self) -> String;
}
