use super::state::Stored;
use super::{Lifeline, MemoryBrokerError, Shared};
use crate::library::communication::broker::{MessageProperties, RawDelivery};
use crate::library::communication::implementation::json::JsonDelivery;
use crate::library::EmptyResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

/// Obligation to acknowledge or reject a delivery from a manually acknowledged consumer
pub(super) struct Settlement {
    pub(super) queue: String,
    pub(super) lifeline: Lifeline,
    pub(super) shared: Arc<Shared>,
    pub(super) _permit: Option<OwnedSemaphorePermit>,
}

impl Settlement {
    fn requeue(self, message: Stored) {
        self.shared.state().requeue(&self.queue, message);
    }

    fn reject(self, message: Stored) {
        self.shared.state().reject(&self.queue, message);
    }
}

/// Message received from a [`MemoryBroker`](super::MemoryBroker)
///
/// Unsettled deliveries go back to the head of their queue when dropped.
pub struct MemoryDelivery {
    message: Stored,
    settlement: Option<Settlement>,
}

impl MemoryDelivery {
    pub(super) fn new(message: Stored, settlement: Option<Settlement>) -> Self {
        Self {
            message,
            settlement,
        }
    }
}

#[async_trait]
impl RawDelivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.envelope.payload
    }

    fn properties(&self) -> &MessageProperties {
        &self.message.envelope.properties
    }

    fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    async fn ack(mut self) -> EmptyResult {
        match self.settlement.take() {
            Some(settlement) if settlement.lifeline.is_closed() => {
                settlement.requeue(self.message.clone());
                Err(MemoryBrokerError::ChannelClosed.into())
            }
            _ => Ok(()),
        }
    }

    async fn nack(mut self, requeue: bool) -> EmptyResult {
        match self.settlement.take() {
            Some(settlement) if settlement.lifeline.is_closed() => {
                settlement.requeue(self.message.clone());
                Err(MemoryBrokerError::ChannelClosed.into())
            }
            Some(settlement) if requeue => {
                settlement.requeue(self.message.clone());
                Ok(())
            }
            Some(settlement) => {
                settlement.reject(self.message.clone());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl JsonDelivery for MemoryDelivery {}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if let Some(settlement) = self.settlement.take() {
            settlement.requeue(self.message.clone());
        }
    }
}
