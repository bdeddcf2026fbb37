use super::super::topology::pattern_matches;
use std::fmt;
use std::time::Duration;

/// Routing algorithm of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes to queues whose binding key equals the routing key
    Direct,
    /// Routes to every bound queue, ignoring the routing key
    Fanout,
    /// Routes to queues whose binding pattern matches the dot-separated routing key
    Topic,
}

impl ExchangeKind {
    /// Whether a message published with `routing_key` reaches a queue bound with `binding_key`
    pub fn routes(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => pattern_matches(binding_key, routing_key),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
            ExchangeKind::Topic => write!(f, "topic"),
        }
    }
}

/// Describes an exchange and its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDescriptor {
    /// Name of the exchange
    pub name: String,
    /// Routing algorithm
    pub kind: ExchangeKind,
    /// Survives broker restarts
    pub durable: bool,
    /// Removed once the last queue has been unbound
    pub auto_delete: bool,
}

impl ExchangeDescriptor {
    /// Durable exchange which is never deleted automatically
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Describes a queue and its parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueDescriptor {
    /// Name of the queue, `None` lets the broker pick a unique one
    pub name: Option<String>,
    /// Survives broker restarts
    pub durable: bool,
    /// Only usable by the declaring connection and removed once it closes
    pub exclusive: bool,
    /// Removed once the last consumer has been cancelled
    pub auto_delete: bool,
    /// Time after which enqueued messages expire
    pub message_ttl: Option<Duration>,
    /// Exchange which receives expired and rejected messages
    pub dead_letter_exchange: Option<String>,
}

impl QueueDescriptor {
    /// Named, durable queue
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            durable: true,
            ..Default::default()
        }
    }

    /// Anonymous queue owned by the declaring connection which is removed when no longer used
    pub fn exclusive() -> Self {
        Self {
            name: None,
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..Default::default()
        }
    }

    /// Expires messages after the given duration
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Routes expired and rejected messages to the given exchange
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Parameters for consuming a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Identifier of the consumer
    pub tag: String,
    /// Deliveries are considered acknowledged as soon as they are sent out
    pub no_ack: bool,
}

impl ConsumeOptions {
    /// Consumer which has to acknowledge every delivery
    pub fn manual_ack(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            no_ack: false,
        }
    }

    /// Consumer whose deliveries are acknowledged by the broker
    pub fn auto_ack(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            no_ack: true,
        }
    }
}
