use super::super::super::{BoxedError, EmptyResult};
use super::MessageProperties;
use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// Message handed to a consumer, providing a raw payload
///
/// Settling a delivery consumes it, thus every delivery can be acknowledged or rejected at most once.
#[async_trait]
pub trait RawDelivery {
    /// Payload of the message
    fn payload(&self) -> &[u8];

    /// Metadata of the message
    fn properties(&self) -> &MessageProperties;

    /// Routing key the message has been published with
    fn routing_key(&self) -> &str;

    /// Acknowledge the message as processed
    async fn ack(self) -> EmptyResult;

    /// Reject the message, either putting it back into the queue or dead-lettering it
    async fn nack(self, requeue: bool) -> EmptyResult;
}

/// Useful functions for [`RawDelivery`] implementations with default implementations
pub trait Delivery: RawDelivery {
    /// Attempts to parse the wire-format payload into a given data structure
    fn parse_payload<T>(&self) -> Result<T, BoxedError>
    where
        T: DeserializeOwned;
}
