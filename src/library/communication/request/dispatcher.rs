use super::super::broker::{DeliveryStream, Envelope, RawDelivery};
use super::PendingRequests;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Matches responses arriving on a private reply queue to the callers waiting for them
pub struct ResponseDispatcher {
    pending: Arc<PendingRequests>,
}

impl ResponseDispatcher {
    /// Creates a new dispatcher resolving waiters of the given registry
    pub fn new(pending: Arc<PendingRequests>) -> Self {
        Self { pending }
    }

    /// Resolves the waiter of a single response, returns whether one was found
    ///
    /// Responses without correlation id and those nobody waits for (late, duplicate or timed out)
    /// are logged and discarded.
    pub fn on_response(&self, reply: Envelope) -> bool {
        let correlation_id = match reply.properties.correlation_id.clone() {
            Some(id) => id,
            None => {
                error!("Discarding response without correlation id");
                return false;
            }
        };

        let resolved = self.pending.resolve(&correlation_id, reply);

        if resolved {
            debug!(%correlation_id, "Dispatched response");
        } else {
            warn!(%correlation_id, "Discarding response nobody is waiting for");
        }

        resolved
    }

    /// Dispatches every delivery of the stream until it ends
    pub async fn run<D>(self, deliveries: DeliveryStream<D>)
    where
        D: RawDelivery + Send + 'static,
    {
        deliveries
            .for_each(|delivery| {
                match delivery {
                    Ok(delivery) => {
                        let reply = Envelope {
                            payload: delivery.payload().to_vec(),
                            properties: delivery.properties().clone(),
                        };

                        self.on_response(reply);
                    }
                    Err(error) => warn!(%error, "Failed to receive response"),
                }

                futures::future::ready(())
            })
            .await;

        debug!("Reply stream ended");
    }
}
