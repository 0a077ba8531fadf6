use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::ctrl::message::CtrlMessage;

/// The request / reply messaging primitive connecting a router to its controller.
///
/// Implementations do the framing and correlate replies with requests. They do not need to
///  enforce timeouts, callers wrap calls in their own.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CtrlChannel: Send + Sync + 'static {
    /// Send a message and wait for the reply to it
    async fn send_and_wait(&self, msg: CtrlMessage) -> anyhow::Result<CtrlMessage>;

    async fn send(&self, msg: CtrlMessage) -> anyhow::Result<()>;
}
