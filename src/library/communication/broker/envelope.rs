use chrono::{DateTime, Utc};
use std::time::Duration;

/// Content type of JSON encoded payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Metadata travelling alongside a message payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Opaque token pairing a request with its response
    pub correlation_id: Option<String>,
    /// Address to which a response should be sent
    pub reply_to: Option<String>,
    /// MIME type of the payload
    pub content_type: Option<String>,
    /// Time after which the broker may discard the message
    pub expiration: Option<Duration>,
    /// Instant at which the message has been published
    pub timestamp: Option<DateTime<Utc>>,
}

/// Message payload and its [`MessageProperties`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Opaque payload, JSON encoded in practice
    pub payload: Vec<u8>,
    /// Metadata of the message
    pub properties: MessageProperties,
}

impl Envelope {
    /// Creates a new envelope stamped with a publication time of `Utc::now()`
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            properties: MessageProperties {
                timestamp: Some(Utc::now()),
                ..Default::default()
            },
        }
    }

    /// Creates a new envelope with a JSON content type
    pub fn json(payload: Vec<u8>) -> Self {
        Self::new(payload).with_content_type(JSON_CONTENT_TYPE)
    }

    /// Sets the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply destination
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    /// Sets the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Sets the time-to-live
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.properties.expiration = Some(expiration);
        self
    }
}
