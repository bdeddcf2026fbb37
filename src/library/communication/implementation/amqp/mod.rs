//! AMQP 0.9.1 brokers like RabbitMQ, backed by [`lapin`]
//!
//! Channels are opened in publisher confirm mode so that mandatory messages which the broker returns
//! as unroutable can be reported to the publisher.

mod channel;
mod delivery;

pub use channel::AmqpChannel;
pub use delivery::AmqpDelivery;

use super::super::broker::{Broker, BrokerConnection};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use lapin::options::ConfirmSelectOptions;
use lapin::uri::AMQPUri;
use lapin::{Connection, ConnectionProperties};
use tracing::{debug, instrument};

/// Broker reachable through an [`AMQPUri`]
#[derive(Clone)]
pub struct AmqpBroker {
    uri: AMQPUri,
    connection_name: String,
}

impl AmqpBroker {
    /// Creates a new instance connecting to the given address
    pub fn new(uri: AMQPUri) -> Self {
        Self {
            uri,
            connection_name: "courier".into(),
        }
    }

    /// Sets the name the connections are shown with in the broker management interface
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Connection = AmqpConnection;

    #[instrument(skip(self), fields(name = %self.connection_name, host = %self.uri.authority.host))]
    async fn connect(&self) -> Result<Self::Connection, BoxedError> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect_uri(self.uri.clone(), properties).await?;

        debug!("Established AMQP connection");
        Ok(AmqpConnection { connection })
    }
}

/// Connection to an [`AmqpBroker`]
pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn channel(&self) -> Result<Self::Channel, BoxedError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(AmqpChannel::new(channel))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> EmptyResult {
        if self.is_open() {
            self.connection.close(200, "shutting down").await?;
        }

        Ok(())
    }
}
