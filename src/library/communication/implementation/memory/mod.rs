//! In-process broker following the routing semantics of AMQP 0.9.1
//!
//! Meant for tests and local experiments. Exchanges route according to their [`ExchangeKind`], queues
//! honour message time-to-live and dead-letter exchanges, exclusive queues vanish together with the
//! connection that declared them and manually acknowledged deliveries return to their queue when they
//! are dropped or their connection goes away before being settled.
//!
//! Additionally, the broker can be instructed to refuse connections or to drop every established
//! connection at once in order to exercise reconnection logic.
//!
//! [`ExchangeKind`]: crate::library::communication::broker::ExchangeKind

mod channel;
mod delivery;
mod state;

pub use channel::MemoryChannel;
pub use delivery::MemoryDelivery;

use super::super::broker::{Broker, BrokerConnection};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use state::{ConnectionId, State};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Errors reported by the [`MemoryBroker`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryBrokerError {
    /// The broker has been instructed to refuse the connection
    #[error("connection refused")]
    ConnectionRefused,
    /// Operation on a closed channel or connection
    #[error("channel is closed")]
    ChannelClosed,
    /// Referenced exchange or queue does not exist
    #[error("no {kind} '{name}'")]
    NotFound {
        /// Type of resource
        kind: &'static str,
        /// Name of the resource
        name: String,
    },
    /// Exclusive queue is owned by another connection
    #[error("cannot obtain exclusive access to locked queue '{0}'")]
    ResourceLocked(String),
    /// Redeclaration with different parameters
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

impl MemoryBrokerError {
    fn queue_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "queue",
            name: name.to_owned(),
        }
    }

    fn exchange_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "exchange",
            name: name.to_owned(),
        }
    }
}

/// Shared closed-flag of a connection or channel
#[derive(Clone)]
pub(super) struct Lifeline(Arc<watch::Sender<bool>>);

impl Lifeline {
    fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self(Arc::new(sender))
    }

    fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    fn close(&self) {
        self.0.send_replace(true);
    }

    /// Resolves once the flag has been raised
    async fn closed(&self) {
        let mut receiver = self.0.subscribe();

        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Link {
    connection: Lifeline,
    channels: Vec<Lifeline>,
}

impl Link {
    fn sever(&self) {
        self.connection.close();

        for channel in &self.channels {
            channel.close();
        }
    }
}

struct Shared {
    state: Mutex<State>,
    links: Mutex<HashMap<ConnectionId, Link>>,
    next_connection: AtomicU64,
    attempts: AtomicU32,
    refusals: AtomicU32,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn links(&self) -> MutexGuard<'_, HashMap<ConnectionId, Link>> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn disconnect(&self, connection: ConnectionId) {
        if let Some(link) = self.links().remove(&connection) {
            link.sever();
        }

        self.state().release(connection);
    }
}

/// Cloneable handle to an in-process broker, clones share the same exchanges and queues
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Creates a new, empty broker
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                links: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                attempts: AtomicU32::new(0),
                refusals: AtomicU32::new(0),
            }),
        }
    }

    /// Refuses the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.refusals.store(count, Ordering::SeqCst);
    }

    /// Total number of connection attempts, including refused ones
    pub fn connection_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Number of connections which are currently open
    pub fn open_connections(&self) -> usize {
        self.shared.links().len()
    }

    /// Drops every established connection as if the network went away
    pub fn sever_connections(&self) {
        let connections: Vec<ConnectionId> = self.shared.links().keys().copied().collect();
        debug!(count = connections.len(), "Severing connections");

        for connection in connections {
            self.shared.disconnect(connection);
        }
    }

    /// Number of messages waiting in a queue, `None` if the queue does not exist
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.state().depth(queue)
    }

    /// Number of consumers attached to a queue, `None` if the queue does not exist
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.shared.state().consumer_count(queue)
    }

    /// Whether a queue with the given name exists
    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.state().has_queue(queue)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Self::Connection, BoxedError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .shared
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();

        if refused {
            return Err(MemoryBrokerError::ConnectionRefused.into());
        }

        let id = self.shared.next_connection.fetch_add(1, Ordering::SeqCst);
        let lifeline = Lifeline::new();

        self.shared.links().insert(
            id,
            Link {
                connection: lifeline.clone(),
                channels: Vec::new(),
            },
        );

        debug!(connection = id, "Accepted connection");

        Ok(MemoryConnection {
            id,
            lifeline,
            shared: self.shared.clone(),
        })
    }
}

/// Connection to a [`MemoryBroker`], closed automatically when dropped
pub struct MemoryConnection {
    id: ConnectionId,
    lifeline: Lifeline,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn channel(&self) -> Result<Self::Channel, BoxedError> {
        let mut links = self.shared.links();
        let link = links
            .get_mut(&self.id)
            .ok_or(MemoryBrokerError::ChannelClosed)?;

        let lifeline = Lifeline::new();
        link.channels.push(lifeline.clone());

        Ok(MemoryChannel::new(self.id, lifeline, self.shared.clone()))
    }

    fn is_open(&self) -> bool {
        !self.lifeline.is_closed()
    }

    async fn close(&self) -> EmptyResult {
        self.shared.disconnect(self.id);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.disconnect(self.id);
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::broker::{
        BrokerChannel, ConsumeOptions, Delivery, Envelope, ExchangeDescriptor, ExchangeKind,
        PublishError, QueueDescriptor, RawDelivery,
    };
    use futures::StreamExt;
    use std::time::Duration;

    async fn channel(broker: &MemoryBroker) -> (MemoryConnection, MemoryChannel) {
        let connection = broker.connect().await.unwrap();
        let channel = connection.channel().await.unwrap();
        (connection, channel)
    }

    async fn bound_queue(channel: &MemoryChannel, kind: ExchangeKind, key: &str) -> String {
        channel
            .declare_exchange(&ExchangeDescriptor::durable("exchange", kind))
            .await
            .unwrap();
        let queue = channel
            .declare_queue(&QueueDescriptor::durable("queue"))
            .await
            .unwrap();
        channel.bind_queue(&queue, "exchange", key).await.unwrap();
        queue
    }

    #[tokio::test]
    async fn route_by_topic_pattern() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = channel(&broker).await;
        bound_queue(&channel, ExchangeKind::Topic, "request.*").await;

        for key in &["request.users", "response.users", "request.users.list"] {
            channel
                .publish("exchange", key, Envelope::new(Vec::new()), false)
                .await
                .unwrap();
        }

        assert_eq!(broker.queue_depth("queue"), Some(1));
    }

    #[tokio::test]
    async fn report_unroutable_mandatory_messages() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = channel(&broker).await;
        bound_queue(&channel, ExchangeKind::Direct, "bound").await;

        let result = channel
            .publish("exchange", "unbound", Envelope::new(Vec::new()), true)
            .await;

        assert!(matches!(result, Err(PublishError::Unroutable { .. })));
        assert!(channel
            .publish("exchange", "unbound", Envelope::new(Vec::new()), false)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn dead_letter_expired_messages() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = channel(&broker).await;

        channel
            .declare_exchange(&ExchangeDescriptor::durable("dlx", ExchangeKind::Fanout))
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDescriptor::durable("dead"))
            .await
            .unwrap();
        channel.bind_queue("dead", "dlx", "").await.unwrap();
        channel
            .declare_exchange(&ExchangeDescriptor::durable("exchange", ExchangeKind::Direct))
            .await
            .unwrap();
        channel
            .declare_queue(
                &QueueDescriptor::durable("queue")
                    .with_message_ttl(Duration::from_millis(10))
                    .with_dead_letter_exchange("dlx"),
            )
            .await
            .unwrap();
        channel.bind_queue("queue", "exchange", "key").await.unwrap();

        channel
            .publish("exchange", "key", Envelope::new(b"late".to_vec()), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(broker.queue_depth("queue"), Some(0));
        assert_eq!(broker.queue_depth("dead"), Some(1));
    }

    #[tokio::test]
    async fn requeue_unsettled_deliveries() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = channel(&broker).await;
        let queue = bound_queue(&channel, ExchangeKind::Direct, "key").await;
        channel
            .publish("exchange", "key", Envelope::json(b"42".to_vec()), true)
            .await
            .unwrap();

        let mut deliveries = channel
            .consume(&queue, ConsumeOptions::manual_ack("test"))
            .await
            .unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.parse_payload::<u32>().unwrap(), 42);
        first.nack(true).await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        drop(second);

        let third = deliveries.next().await.unwrap().unwrap();
        third.ack().await.unwrap();

        assert_eq!(broker.queue_depth(&queue), Some(0));
    }

    #[tokio::test]
    async fn lock_exclusive_queues_to_their_connection() {
        let broker = MemoryBroker::new();
        let (owner, owner_channel) = channel(&broker).await;
        let (_other, other_channel) = channel(&broker).await;

        let queue = owner_channel
            .declare_queue(&QueueDescriptor::exclusive())
            .await
            .unwrap();
        assert!(queue.starts_with("amq.gen-"));

        let result = other_channel
            .consume(&queue, ConsumeOptions::auto_ack("intruder"))
            .await;
        assert!(result.is_err());

        owner.close().await.unwrap();
        assert!(!broker.has_queue(&queue));
        assert!(!owner_channel.is_open());
    }

    #[tokio::test]
    async fn end_consumers_of_severed_connections() {
        let broker = MemoryBroker::new();
        let (connection, channel) = channel(&broker).await;
        let queue = bound_queue(&channel, ExchangeKind::Direct, "key").await;

        let mut deliveries = channel
            .consume(&queue, ConsumeOptions::manual_ack("test"))
            .await
            .unwrap();

        broker.sever_connections();

        assert!(deliveries.next().await.is_none());
        assert!(!connection.is_open());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn refuse_connections_on_request() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);

        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connection_attempts(), 2);
    }
}
