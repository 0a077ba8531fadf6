use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::xgress::payload::{Acknowledgement, Address, Payload};
use crate::xgress::retransmission::PayloadBufferForwarder;

/// Collects everything a retransmission buffer forwards into the fabric
#[derive(Default)]
pub struct CollectingForwarder {
    payloads: Mutex<Vec<(Address, Payload)>>,
    acknowledgements: Mutex<Vec<(Address, Acknowledgement)>>,
}
impl CollectingForwarder {
    pub fn new() -> CollectingForwarder {
        Default::default()
    }

    pub async fn payloads(&self) -> Vec<(Address, Payload)> {
        self.payloads.lock().await.clone()
    }

    pub async fn acknowledgements(&self) -> Vec<(Address, Acknowledgement)> {
        self.acknowledgements.lock().await.clone()
    }
}

#[async_trait]
impl PayloadBufferForwarder for CollectingForwarder {
    async fn forward_payload(&self, src_address: &Address, payload: Payload) -> anyhow::Result<()> {
        self.payloads.lock().await.push((src_address.clone(), payload));
        Ok(())
    }

    async fn forward_acknowledgement(&self, src_address: &Address, acknowledgement: Acknowledgement) -> anyhow::Result<()> {
        self.acknowledgements.lock().await.push((src_address.clone(), acknowledgement));
        Ok(())
    }
}
