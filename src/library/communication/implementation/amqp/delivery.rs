use crate::library::communication::broker::{MessageProperties, RawDelivery};
use crate::library::communication::implementation::json::JsonDelivery;
use crate::library::EmptyResult;
use async_trait::async_trait;
use chrono::TimeZone;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::BasicProperties;
use std::time::Duration;

fn message_properties(properties: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<lapin::types::ShortString>| value.as_ref().map(|v| v.as_str().to_owned());

    MessageProperties {
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
        content_type: text(properties.content_type()),
        expiration: properties
            .expiration()
            .as_ref()
            .and_then(|millis| millis.as_str().parse().ok())
            .map(Duration::from_millis),
        timestamp: properties
            .timestamp()
            .and_then(|seconds| i64::try_from(seconds).ok())
            .and_then(|seconds| chrono::Utc.timestamp_opt(seconds, 0).single()),
    }
}

/// Message received from an [`AmqpBroker`](super::AmqpBroker)
pub struct AmqpDelivery {
    delivery: Delivery,
    properties: MessageProperties,
    no_ack: bool,
}

impl AmqpDelivery {
    pub(super) fn new(delivery: Delivery, no_ack: bool) -> Self {
        Self {
            properties: message_properties(&delivery.properties),
            delivery,
            no_ack,
        }
    }
}

#[async_trait]
impl RawDelivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    async fn ack(self) -> EmptyResult {
        if !self.no_ack {
            self.delivery.acker.ack(BasicAckOptions::default()).await?;
        }

        Ok(())
    }

    async fn nack(self, requeue: bool) -> EmptyResult {
        if !self.no_ack {
            let options = BasicNackOptions {
                requeue,
                ..Default::default()
            };

            self.delivery.acker.nack(options).await?;
        }

        Ok(())
    }
}

impl JsonDelivery for AmqpDelivery {}
