//! Abstraction over publish/subscribe message brokers
//!
//! The RPC machinery only relies on a small set of broker primitives which are modelled after
//! AMQP 0.9.1 but deliberately kept independent of any client library:
//!
//! - A [`Broker`] knows how to reach the server and hands out [`BrokerConnections`](BrokerConnection)
//! - A connection multiplexes one or more [`BrokerChannels`](BrokerChannel)
//! - A channel declares exchanges and queues, binds them together, publishes [`Envelopes`](Envelope)
//!   and consumes [`Deliveries`](Delivery) from queues
//!
//! Implementations can be found in the [`implementation`](super::implementation) module.

mod delivery;
mod descriptor;
mod envelope;

pub use delivery::*;
pub use descriptor::*;
pub use envelope::*;

use super::super::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Channel type handed out by connections of a given [`Broker`]
pub type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

/// Delivery type produced by channels of a given [`Broker`]
pub type DeliveryOf<B> = <ChannelOf<B> as BrokerChannel>::Delivery;

/// Stream of deliveries from a queue, ends when the consumer is cancelled or the link drops
pub type DeliveryStream<D> = BoxStream<'static, Result<D, BoxedError>>;

/// Errors that may occur while publishing an [`Envelope`]
#[derive(Error, Debug)]
pub enum PublishError {
    /// Mandatory message could not be routed to any queue
    #[error("message to exchange '{exchange}' with routing key '{routing_key}' is unroutable")]
    Unroutable {
        /// Exchange the message was published to
        exchange: String,
        /// Routing key used while publishing
        routing_key: String,
    },
    /// Channel or connection level failure
    #[error("channel failure while publishing")]
    Channel(#[source] BoxedError),
}

/// Entry point to a message broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connection type established by this broker
    type Connection: BrokerConnection;

    /// Opens a new connection to the broker
    async fn connect(&self) -> Result<Self::Connection, BoxedError>;
}

/// Established link to a message broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Channel type opened on this connection
    type Channel: BrokerChannel;

    /// Opens a new channel on the connection
    async fn channel(&self) -> Result<Self::Channel, BoxedError>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Closes the connection and every channel opened on it
    async fn close(&self) -> EmptyResult;
}

/// Lightweight, cloneable handle on which all messaging operations are performed
#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    /// Delivery type returned when consuming from queues
    type Delivery: Delivery + Send + Sync + 'static;

    /// Declares an exchange, succeeds if an identical one already exists
    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> EmptyResult;

    /// Declares a queue and returns its name (which is assigned by the broker for anonymous queues)
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<String, BoxedError>;

    /// Binds a queue to an exchange using a routing key or pattern
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> EmptyResult;

    /// Publishes an envelope to an exchange
    ///
    /// When `mandatory` is set, messages which can not be routed to any queue are
    /// reported as [`PublishError::Unroutable`] instead of being silently dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        mandatory: bool,
    ) -> Result<(), PublishError>;

    /// Limits the number of unacknowledged deliveries handed to consumers of this channel
    async fn set_prefetch(&self, count: u16) -> EmptyResult;

    /// Starts consuming a queue
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream<Self::Delivery>, BoxedError>;

    /// Whether the channel and its connection are still usable
    fn is_open(&self) -> bool;

    /// Closes the channel
    async fn close(&self) -> EmptyResult;
}
