//! Exchanges, queues and bindings implementing the routing semantics of a delivery mode
//!
//! Requests and responses share the broker but must never be confused with each other. A [`Topology`]
//! captures the [`DeliveryMode`] once and derives everything that depends on it: which exchanges
//! and queues have to exist, how they are bound, which routing key a request is published with and
//! where its response has to be sent.
//!
//! - **Direct**: the request queue is bound with an exact routing key. The private reply queue of each
//!   client is bound to the same exchange under its own name.
//! - **Fanout**: the request queue is bound without a key and every bound queue receives every request.
//!   Responses travel over a companion direct exchange as they would otherwise reach every request queue.
//! - **Topic**: the request queue is bound with a wildcard pattern like `request.*`. Responses share the
//!   exchange but are published below the [`RESPONSE_PREFIX`] so they never match the request binding.

mod pattern;

pub use pattern::pattern_matches;

use super::super::{BoxedError, EmptyResult};
use super::broker::{BrokerChannel, ExchangeDescriptor, ExchangeKind, QueueDescriptor};
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Default exchange for [`DeliveryMode::Direct`]
pub const DIRECT_EXCHANGE: &str = "direct_exchange";
/// Default exchange for [`DeliveryMode::Fanout`]
pub const FANOUT_EXCHANGE: &str = "fanout_exchange";
/// Default exchange for [`DeliveryMode::Topic`]
pub const TOPIC_EXCHANGE: &str = "topic_exchange";
/// Default name of the durable request queue
pub const REQUEST_QUEUE: &str = "data_requests_queue";
/// Prefix prepended to reply routing keys in [`DeliveryMode::Topic`]
pub const RESPONSE_PREFIX: &str = "response.";

const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(10);

/// Errors caused by an invalid topology
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    /// The request binding would also receive responses
    #[error("topic pattern '{0}' matches response routing keys")]
    EchoingPattern(String),
    /// A topic binding requires a pattern
    #[error("topic pattern must not be empty")]
    EmptyPattern,
}

/// How requests are routed from clients to servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Exact match of the routing key
    Direct {
        /// Key the request queue is bound with
        routing_key: String,
    },
    /// Every bound queue receives every request
    Fanout,
    /// Hierarchical, dot-separated pattern match
    Topic {
        /// Pattern the request queue is bound with, e.g. `request.*`
        pattern: String,
    },
}

impl DeliveryMode {
    /// Exchange type implementing this mode
    pub fn exchange_kind(&self) -> ExchangeKind {
        match self {
            DeliveryMode::Direct { .. } => ExchangeKind::Direct,
            DeliveryMode::Fanout => ExchangeKind::Fanout,
            DeliveryMode::Topic { .. } => ExchangeKind::Topic,
        }
    }

    /// Key or pattern the request queue is bound with
    pub fn binding_key(&self) -> &str {
        match self {
            DeliveryMode::Direct { routing_key } => routing_key,
            DeliveryMode::Fanout => "",
            DeliveryMode::Topic { pattern } => pattern,
        }
    }

    fn default_exchange(&self) -> &'static str {
        match self {
            DeliveryMode::Direct { .. } => DIRECT_EXCHANGE,
            DeliveryMode::Fanout => FANOUT_EXCHANGE,
            DeliveryMode::Topic { .. } => TOPIC_EXCHANGE,
        }
    }
}

/// Declared exchanges, queues and bindings for one [`DeliveryMode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    mode: DeliveryMode,
    exchange: String,
    queue: String,
    message_ttl: Duration,
    response_ttl: Duration,
}

impl Topology {
    /// Creates a new topology using the default exchange and queue names of the given mode
    pub fn new(mode: DeliveryMode) -> Result<Self, TopologyError> {
        if let DeliveryMode::Topic { pattern } = &mode {
            if pattern.is_empty() {
                return Err(TopologyError::EmptyPattern);
            }

            // Reply keys always start with the prefix segment, only the leading segment can let them in
            let prefix = RESPONSE_PREFIX.trim_end_matches('.');
            let leading = pattern.split('.').next().unwrap_or_default();
            if leading == "*" || leading == "#" || leading == prefix {
                return Err(TopologyError::EchoingPattern(pattern.to_owned()));
            }
        }

        Ok(Self::with_defaults(mode))
    }

    fn with_defaults(mode: DeliveryMode) -> Self {
        Self {
            exchange: mode.default_exchange().to_owned(),
            queue: REQUEST_QUEUE.to_owned(),
            message_ttl: DEFAULT_MESSAGE_TTL,
            response_ttl: DEFAULT_RESPONSE_TTL,
            mode,
        }
    }

    /// Direct topology binding the request queue with the given key
    pub fn direct(routing_key: impl Into<String>) -> Self {
        Self::with_defaults(DeliveryMode::Direct {
            routing_key: routing_key.into(),
        })
    }

    /// Fanout topology
    pub fn fanout() -> Self {
        Self::with_defaults(DeliveryMode::Fanout)
    }

    /// Topic topology binding the request queue with the given pattern
    pub fn topic(pattern: impl Into<String>) -> Result<Self, TopologyError> {
        Self::new(DeliveryMode::Topic {
            pattern: pattern.into(),
        })
    }

    /// Overrides the name of the request exchange
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Overrides the name of the request queue
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Overrides how long requests may sit in the request queue
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    /// Overrides how long responses may sit in reply queues
    pub fn with_response_ttl(mut self, ttl: Duration) -> Self {
        self.response_ttl = ttl;
        self
    }

    /// Delivery mode of this topology
    pub fn mode(&self) -> &DeliveryMode {
        &self.mode
    }

    /// Exchange requests are published to
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Durable queue requests are consumed from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Time-to-live of requests in the request queue
    pub fn message_ttl(&self) -> Duration {
        self.message_ttl
    }

    /// Time-to-live of responses
    pub fn response_ttl(&self) -> Duration {
        self.response_ttl
    }

    /// Exchange receiving expired and rejected requests
    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.exchange)
    }

    /// Queue collecting dead-lettered requests
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dead", self.queue)
    }

    /// Exchange responses are published to
    pub fn reply_exchange(&self) -> Cow<'_, str> {
        match self.mode {
            DeliveryMode::Fanout => Cow::Owned(format!("{}.reply", self.exchange)),
            _ => Cow::Borrowed(&self.exchange),
        }
    }

    /// Routing key a request is published with, fanout exchanges ignore any caller supplied key
    pub fn request_routing_key<'a>(&self, routing_key: &'a str) -> &'a str {
        match self.mode {
            DeliveryMode::Fanout => "",
            _ => routing_key,
        }
    }

    /// Key a private reply queue is bound with
    pub fn reply_binding_key(&self, reply_queue: &str) -> String {
        self.reply_routing_key(reply_queue)
    }

    /// Routing key a response to the given reply destination is published with
    pub fn reply_routing_key(&self, reply_to: &str) -> String {
        match self.mode {
            DeliveryMode::Topic { .. } => format!("{}{}", RESPONSE_PREFIX, reply_to),
            _ => reply_to.to_owned(),
        }
    }

    /// Declares everything a server needs to consume requests
    ///
    /// This includes the request exchange, the durable request queue, its binding and
    /// the dead-letter exchange and queue receiving expired or rejected requests.
    #[instrument(skip(self, channel), fields(exchange = %self.exchange, queue = %self.queue, mode = %self.mode.exchange_kind()))]
    pub async fn declare_requests<C: BrokerChannel>(&self, channel: &C) -> EmptyResult {
        self.declare_exchanges(channel).await?;

        let dead_letter_exchange = self.dead_letter_exchange();
        let dead_letter_queue = self.dead_letter_queue();
        channel
            .declare_exchange(&ExchangeDescriptor::durable(
                &dead_letter_exchange,
                ExchangeKind::Fanout,
            ))
            .await?;
        channel
            .declare_queue(&QueueDescriptor::durable(&dead_letter_queue))
            .await?;
        channel
            .bind_queue(&dead_letter_queue, &dead_letter_exchange, "")
            .await?;

        let queue = QueueDescriptor::durable(&self.queue)
            .with_message_ttl(self.message_ttl)
            .with_dead_letter_exchange(dead_letter_exchange);
        channel.declare_queue(&queue).await?;
        channel
            .bind_queue(&self.queue, &self.exchange, self.mode.binding_key())
            .await?;

        debug!("Declared request topology");
        Ok(())
    }

    /// Declares a private reply queue and binds it, returning its name
    #[instrument(skip(self, channel), fields(exchange = %self.exchange, mode = %self.mode.exchange_kind()))]
    pub async fn declare_replies<C: BrokerChannel>(
        &self,
        channel: &C,
    ) -> Result<String, BoxedError> {
        self.declare_exchanges(channel).await?;

        let queue = channel.declare_queue(&QueueDescriptor::exclusive()).await?;
        let binding_key = self.reply_binding_key(&queue);
        channel
            .bind_queue(&queue, &self.reply_exchange(), &binding_key)
            .await?;

        debug!(%queue, %binding_key, "Declared reply queue");
        Ok(queue)
    }

    async fn declare_exchanges<C: BrokerChannel>(&self, channel: &C) -> EmptyResult {
        channel
            .declare_exchange(&ExchangeDescriptor::durable(
                &self.exchange,
                self.mode.exchange_kind(),
            ))
            .await?;

        if let DeliveryMode::Fanout = self.mode {
            channel
                .declare_exchange(&ExchangeDescriptor::durable(
                    self.reply_exchange(),
                    ExchangeKind::Direct,
                ))
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ignore_routing_key_for_fanout() {
        assert_eq!(Topology::fanout().request_routing_key("ignored"), "");
        assert_eq!(
            Topology::direct("data_requests_queue").request_routing_key("data_requests_queue"),
            "data_requests_queue"
        );
    }

    #[test]
    fn prefix_topic_replies() {
        let topology = Topology::topic("request.*").unwrap();

        assert_eq!(
            topology.reply_routing_key("amq.gen-42"),
            "response.amq.gen-42"
        );
        assert_eq!(topology.reply_exchange(), "topic_exchange");
        assert!(!pattern_matches(
            topology.mode().binding_key(),
            &topology.reply_routing_key("amq.gen-42")
        ));
    }

    #[test]
    fn build_infallible_modes_like_the_checked_constructor() {
        assert_eq!(
            Ok(Topology::direct("jobs")),
            Topology::new(DeliveryMode::Direct {
                routing_key: "jobs".into()
            })
        );
        assert_eq!(Ok(Topology::fanout()), Topology::new(DeliveryMode::Fanout));
        assert_eq!(Topology::fanout().exchange(), FANOUT_EXCHANGE);
        assert_eq!(Topology::direct("jobs").queue(), REQUEST_QUEUE);
    }

    #[test]
    fn route_fanout_replies_through_companion_exchange() {
        let topology = Topology::fanout().with_exchange("events");

        assert_eq!(topology.reply_exchange(), "events.reply");
        assert_eq!(topology.reply_routing_key("amq.gen-42"), "amq.gen-42");
    }

    #[test]
    fn reject_echoing_patterns() {
        assert_eq!(
            Topology::topic("#"),
            Err(TopologyError::EchoingPattern("#".into()))
        );
        assert_eq!(
            Topology::topic("*.*"),
            Err(TopologyError::EchoingPattern("*.*".into()))
        );
        assert_eq!(
            Topology::topic("response.#"),
            Err(TopologyError::EchoingPattern("response.#".into()))
        );
        assert_eq!(Topology::topic(""), Err(TopologyError::EmptyPattern));
        assert!(Topology::topic("request.#").is_ok());
    }

    #[test]
    fn derive_dead_letter_names() {
        let topology = Topology::direct("data_requests_queue");

        assert_eq!(topology.dead_letter_exchange(), "direct_exchange.dlx");
        assert_eq!(topology.dead_letter_queue(), "data_requests_queue.dead");
    }
}
