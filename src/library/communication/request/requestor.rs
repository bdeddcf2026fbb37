use super::super::broker::{Broker, BrokerChannel, ChannelOf, ConsumeOptions, Envelope};
use super::super::connection::{ConnectionError, ConnectionManager, ConnectionState};
use super::super::implementation::json::json_envelope;
use super::super::topology::Topology;
use super::{
    CorrelationId, PendingRequests, RemoteError, ResponseDispatcher, RpcError, ERROR_CONTENT_TYPE,
};
use crate::library::helpers::RetryPolicy;
use crate::library::EmptyResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, Span};
use uuid::Uuid;

#[derive(Default)]
struct Replies {
    queue: Option<String>,
    dispatcher: Option<JoinHandle<()>>,
}

type SharedReplies = Arc<Mutex<Replies>>;

fn lock(replies: &SharedReplies) -> MutexGuard<'_, Replies> {
    replies
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Requesting side of a remote procedure call
///
/// All calls share one connection, one private reply queue and one [`ResponseDispatcher`] task. Every
/// call is tagged with a fresh [`CorrelationId`] which the dispatcher uses to route the response
/// back to the caller. When the link to the broker drops, the next call re-establishes it including
/// a new reply queue.
pub struct RpcClient<B: Broker + 'static> {
    topology: Arc<Topology>,
    manager: ConnectionManager<B>,
    pending: Arc<PendingRequests>,
    replies: SharedReplies,
}

impl<B: Broker + 'static> RpcClient<B> {
    /// Creates a new, disconnected client
    pub fn new(broker: B, topology: Topology, policy: RetryPolicy) -> Self {
        Self {
            topology: Arc::new(topology),
            manager: ConnectionManager::new(broker, policy),
            pending: Arc::new(PendingRequests::new()),
            replies: SharedReplies::default(),
        }
    }

    /// Topology requests are sent through
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// State of the broker link
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Number of calls currently waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Name of the private reply queue, if connected
    pub fn reply_queue(&self) -> Option<String> {
        lock(&self.replies).queue.clone()
    }

    /// Establishes the link, declares the reply queue and starts dispatching responses
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.manager.connect(self.setup()).await
    }

    fn setup(&self) -> impl Fn(ChannelOf<B>) -> BoxFuture<'static, EmptyResult> + Send + Sync {
        let topology = self.topology.clone();
        let pending = self.pending.clone();
        let replies = self.replies.clone();

        move |channel| {
            let topology = topology.clone();
            let pending = pending.clone();
            let replies = replies.clone();

            async move {
                let queue = topology.declare_replies(&channel).await?;
                let tag = format!("courier-client-{}", Uuid::new_v4());
                let deliveries = channel
                    .consume(&queue, ConsumeOptions::auto_ack(tag))
                    .await?;

                let dispatcher = tokio::spawn(ResponseDispatcher::new(pending).run(deliveries));

                let mut replies = lock(&replies);
                if let Some(previous) = replies.dispatcher.replace(dispatcher) {
                    previous.abort();
                }
                replies.queue = Some(queue);

                Ok(())
            }
            .boxed()
        }
    }

    /// Sends a request and waits for its response
    ///
    /// The request expires in the broker after `timeout` and the call fails with [`RpcError::Timeout`] if
    /// no response arrives within it. For fanout topologies the routing key is ignored. Messages which
    /// can not be routed to any queue fail right away with a [`PublishError`](super::super::broker::PublishError).
    #[instrument(skip(self, payload), fields(exchange = %self.topology.exchange(), correlation_id))]
    pub async fn publish<T, R>(
        &self,
        payload: &T,
        routing_key: &str,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        T: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let channel = self.manager.channel(self.setup()).await?;
        let reply_to = self.reply_queue().ok_or(ConnectionError::Closed)?;

        let correlation_id = CorrelationId::new();
        Span::current().record("correlation_id", &correlation_id.as_str());

        let envelope = json_envelope(payload)
            .map_err(RpcError::Encode)?
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(reply_to)
            .with_expiration(timeout);

        // Registering before publishing makes sure a fast response always finds its waiter
        let waiter = self.pending.register(correlation_id)?;

        channel
            .publish(
                self.topology.exchange(),
                self.topology.request_routing_key(routing_key),
                envelope,
                true,
            )
            .await?;

        debug!("Published request");

        let reply = waiter.wait(timeout).await?;
        decode(reply)
    }

    /// Cancels every outstanding call, stops dispatching responses and closes the link
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let cancelled = self.pending.close();

        let dispatcher = {
            let mut replies = lock(&self.replies);
            replies.queue = None;
            replies.dispatcher.take()
        };

        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }

        self.manager.stop().await;
        info!(cancelled, "Client stopped");
    }
}

impl<B: Broker + 'static> Drop for RpcClient<B> {
    fn drop(&mut self) {
        if let Some(dispatcher) = lock(&self.replies).dispatcher.take() {
            dispatcher.abort();
        }
    }
}

fn decode<R: DeserializeOwned>(reply: Envelope) -> Result<R, RpcError> {
    if reply.properties.content_type.as_deref() == Some(ERROR_CONTENT_TYPE) {
        let remote: RemoteError =
            serde_json::from_slice(&reply.payload).map_err(|e| RpcError::Protocol(e.into()))?;
        return Err(RpcError::Remote(remote));
    }

    serde_json::from_slice(&reply.payload).map_err(|e| RpcError::Protocol(e.into()))
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::BlackboxError;
    use serde_json::{json, Value};

    #[test]
    fn decode_successful_responses() {
        let reply = Envelope::json(br#"{"processed":true}"#.to_vec());
        let value: Value = decode(reply).unwrap();

        assert_eq!(value, json!({ "processed": true }));
    }

    #[test]
    fn decode_structured_errors() {
        let body = serde_json::to_vec(&RemoteError::handler(BlackboxError::from_message("boom"))).unwrap();
        let reply = Envelope::new(body).with_content_type(ERROR_CONTENT_TYPE);

        match decode::<Value>(reply) {
            Err(RpcError::Remote(error)) => assert_eq!(error.causes.summary(), Some("boom")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn report_malformed_responses() {
        let reply = Envelope::json(b"not json".to_vec());

        assert!(matches!(
            decode::<Value>(reply),
            Err(RpcError::Protocol(_))
        ));
    }
}
