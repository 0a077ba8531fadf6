use async_trait::async_trait;

use crate::xgress::payload::Payload;
use crate::xgress::xgress::Xgress;

/// Installs the appropriate handlers on a freshly created xgress, before it is started
#[async_trait]
pub trait BindHandler: Send + Sync + 'static {
    async fn handle_xgress_bind(&self, x: &Xgress);
}

/// Invoked for all data received from the xgress's peer, typically connecting the xgress to the
///  fabric's forwarding
#[async_trait]
pub trait ReceiveHandler: Send + Sync + 'static {
    async fn handle_xgress_receive(&self, payload: Payload, x: &Xgress);
}

/// Invoked exactly once when an xgress closes
pub trait CloseHandler: Send + Sync + 'static {
    fn handle_xgress_close(&self, x: &Xgress);
}

/// Observes the data flowing through an xgress. `tx` is called immediately before a payload is
///  written to the peer.
pub trait PeekHandler: Send + Sync + 'static {
    fn rx(&self, x: &Xgress, payload: &Payload);
    fn tx(&self, x: &Xgress, payload: &Payload);
    fn close(&self, x: &Xgress);
}
