use super::AmqpDelivery;
use crate::library::communication::broker::{
    BrokerChannel, ConsumeOptions, DeliveryStream, Envelope, ExchangeDescriptor, ExchangeKind,
    PublishError, QueueDescriptor,
};
use crate::library::helpers::as_millis;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};

/// Channel on an [`AmqpConnection`](super::AmqpConnection) in publisher confirm mode
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub(super) fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn queue_arguments(queue: &QueueDescriptor) -> FieldTable {
    let mut arguments = FieldTable::default();

    if let Some(ttl) = queue.message_ttl {
        let millis = i64::try_from(as_millis(ttl)).unwrap_or(i64::MAX);
        arguments.insert("x-message-ttl".into(), AMQPValue::LongLongInt(millis));
    }

    if let Some(exchange) = &queue.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }

    arguments
}

fn basic_properties(envelope: &Envelope) -> BasicProperties {
    let metadata = &envelope.properties;
    let mut properties = BasicProperties::default();

    if let Some(correlation_id) = &metadata.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }

    if let Some(reply_to) = &metadata.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }

    if let Some(content_type) = &metadata.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }

    if let Some(expiration) = metadata.expiration {
        properties =
            properties.with_expiration(ShortString::from(as_millis(expiration).to_string()));
    }

    if let Some(timestamp) = metadata.timestamp.and_then(|t| u64::try_from(t.timestamp()).ok()) {
        properties = properties.with_timestamp(timestamp);
    }

    properties
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    type Delivery = AmqpDelivery;

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> EmptyResult {
        let options = ExchangeDeclareOptions {
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            ..Default::default()
        };

        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                options,
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<String, BoxedError> {
        let options = QueueDeclareOptions {
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            ..Default::default()
        };

        let declared = self
            .channel
            .queue_declare(
                queue.name.as_deref().unwrap_or_default(),
                options,
                queue_arguments(queue),
            )
            .await?;

        Ok(declared.name().as_str().to_owned())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> EmptyResult {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
        mandatory: bool,
    ) -> Result<(), PublishError> {
        let options = BasicPublishOptions {
            mandatory,
            ..Default::default()
        };

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                options,
                &envelope.payload,
                basic_properties(&envelope),
            )
            .await
            .map_err(|e| PublishError::Channel(e.into()))?
            .await
            .map_err(|e| PublishError::Channel(e.into()))?;

        match confirmation {
            Confirmation::Ack(Some(_returned)) => Err(PublishError::Unroutable {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            }),
            Confirmation::Nack(_) => Err(PublishError::Channel(
                "message has been rejected by the broker".into(),
            )),
            _ => Ok(()),
        }
    }

    async fn set_prefetch(&self, count: u16) -> EmptyResult {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream<Self::Delivery>, BoxedError> {
        let no_ack = options.no_ack;
        let consume_options = BasicConsumeOptions {
            no_ack,
            ..Default::default()
        };

        let consumer = self
            .channel
            .basic_consume(queue, &options.tag, consume_options, FieldTable::default())
            .await?;

        let deliveries = consumer.map(move |delivery| {
            delivery
                .map(|delivery| AmqpDelivery::new(delivery, no_ack))
                .map_err(Into::into)
        });

        Ok(deliveries.boxed())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> EmptyResult {
        if self.is_open() {
            self.channel.close(200, "shutting down").await?;
        }

        Ok(())
    }
}
