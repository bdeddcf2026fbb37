use super::delivery::{MemoryDelivery, Settlement};
use super::state::ConnectionId;
use super::{Lifeline, MemoryBrokerError, Shared};
use crate::library::communication::broker::{
    BrokerChannel, ConsumeOptions, DeliveryStream, Envelope, ExchangeDescriptor, PublishError,
    QueueDescriptor,
};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::trace;

/// Channel on a [`MemoryConnection`](super::MemoryConnection)
#[derive(Clone)]
pub struct MemoryChannel {
    connection: ConnectionId,
    lifeline: Lifeline,
    shared: Arc<Shared>,
    prefetch: Arc<AtomicU16>,
}

impl MemoryChannel {
    pub(super) fn new(connection: ConnectionId, lifeline: Lifeline, shared: Arc<Shared>) -> Self {
        Self {
            connection,
            lifeline,
            shared,
            prefetch: Arc::new(AtomicU16::new(0)),
        }
    }

    fn ensure_open(&self) -> Result<(), MemoryBrokerError> {
        if self.lifeline.is_closed() {
            Err(MemoryBrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> EmptyResult {
        self.ensure_open()?;
        self.shared.state().declare_exchange(exchange)?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<String, BoxedError> {
        self.ensure_open()?;
        let name = self.shared.state().declare_queue(queue, self.connection)?;
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> EmptyResult {
        self.ensure_open()?;
        self.shared
            .state()
            .bind(queue, exchange, routing_key, self.connection)?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        mandatory: bool,
    ) -> Result<(), PublishError> {
        self.ensure_open()
            .map_err(|e| PublishError::Channel(e.into()))?;

        let routed = self
            .shared
            .state()
            .publish(exchange, routing_key, &envelope)
            .map_err(|e| PublishError::Channel(e.into()))?;

        if routed == 0 && mandatory {
            return Err(PublishError::Unroutable {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }

        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> EmptyResult {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream<Self::Delivery>, BoxedError> {
        self.ensure_open()?;
        let notify = self.shared.state().subscribe(queue, self.connection)?;

        // Prefetch limits do not apply to consumers without acknowledgements
        let prefetch = match self.prefetch.load(Ordering::SeqCst) {
            0 => None,
            _ if options.no_ack => None,
            count => Some(Arc::new(Semaphore::new(count as usize))),
        };

        trace!(queue, tag = %options.tag, "Starting consumer");

        let consumer = Consumer {
            queue: queue.to_owned(),
            notify,
            prefetch,
            no_ack: options.no_ack,
            lifeline: self.lifeline.clone(),
            shared: self.shared.clone(),
        };

        let deliveries = stream::unfold(consumer, |mut consumer| async move {
            consumer
                .next_delivery()
                .await
                .map(|delivery| (Ok(delivery), consumer))
        });

        Ok(deliveries.boxed())
    }

    fn is_open(&self) -> bool {
        !self.lifeline.is_closed()
    }

    async fn close(&self) -> EmptyResult {
        self.lifeline.close();
        Ok(())
    }
}

struct Consumer {
    queue: String,
    notify: Arc<Notify>,
    prefetch: Option<Arc<Semaphore>>,
    no_ack: bool,
    lifeline: Lifeline,
    shared: Arc<Shared>,
}

impl Consumer {
    async fn next_delivery(&mut self) -> Option<MemoryDelivery> {
        loop {
            if self.lifeline.is_closed() {
                return None;
            }

            let permit = match &self.prefetch {
                Some(semaphore) => {
                    let semaphore = semaphore.clone();
                    tokio::select! {
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => return None,
                        },
                        _ = self.lifeline.closed() => return None,
                    }
                }
                None => None,
            };

            let popped = self.shared.state().pop(&self.queue);

            match popped {
                Ok(Some(message)) => {
                    let settlement = if self.no_ack {
                        None
                    } else {
                        Some(Settlement {
                            queue: self.queue.clone(),
                            lifeline: self.lifeline.clone(),
                            shared: self.shared.clone(),
                            _permit: permit,
                        })
                    };

                    return Some(MemoryDelivery::new(message, settlement));
                }
                Ok(None) => drop(permit),
                Err(_) => return None,
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.lifeline.closed() => return None,
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shared.state().unsubscribe(&self.queue);
    }
}
